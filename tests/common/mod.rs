//! Shared end-to-end harness: spawn a real server on an ephemeral port and
//! round-trip OP_MSG commands over a real `TcpStream`, the way a driver
//! would. Grounded on `src/server.rs`'s own `#[cfg(test)]` helper of the
//! same shape.

use bson::Document;
use jongodb::config::Config;
use jongodb::dispatch::{Dispatcher, Topology};
use jongodb::engine::Engine;
use jongodb::protocol;
use jongodb::server::{self, Handle};
use jongodb::txn::TransactionManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct TestServer {
    pub handle: Handle,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_replica_set(None).await
    }

    pub async fn start_with_replica_set(replica_set: Option<String>) -> Self {
        let mut cfg = Config::default();
        cfg.port = 0;
        let topology = Topology::new(cfg.host.clone(), 0, replica_set);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Engine::new()),
            Arc::new(TransactionManager::new()),
            topology,
        ));
        let handle = server::spawn_with_shutdown(cfg, dispatcher).await.expect("bind");
        TestServer { handle }
    }

    pub async fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.handle.local_addr).await.expect("connect");
        Client { stream }
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    /// Send `body` as an OP_MSG with the given requestId and return the
    /// decoded response body together with the response's `responseTo`.
    pub async fn command(&mut self, request_id: i32, body: Document) -> (Document, i32) {
        let wire = protocol::encode_op_msg(&body, 0, request_id).expect("encode");
        self.stream.write_all(&wire).await.expect("write");

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.expect("read length");
        let message_length = i32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; message_length - 4];
        self.stream.read_exact(&mut rest).await.expect("read rest");

        let mut full = len_buf.to_vec();
        full.extend_from_slice(&rest);
        let (header, _) = protocol::MessageHeader::parse(&full).expect("header");
        let decoded = protocol::decode_op_msg(&full).expect("decode");
        (decoded.body, header.response_to)
    }
}
