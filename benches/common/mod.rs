//! Shared benchmark harness: spin up an in-memory server on an ephemeral
//! port and round-trip OP_MSG commands over a real socket.

use bson::Document;
use jongodb::config::Config;
use jongodb::dispatch::{Dispatcher, Topology};
use jongodb::engine::Engine;
use jongodb::protocol::{self, MessageHeader, OP_MSG};
pub use jongodb::server::Handle;
use jongodb::server;
use jongodb::txn::TransactionManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub async fn spawn() -> (Handle, TcpStream) {
    let mut cfg = Config::default();
    cfg.port = 0;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(Engine::new()),
        Arc::new(TransactionManager::new()),
        Topology::new(cfg.host.clone(), 0, None),
    ));
    let handle = server::spawn_with_shutdown(cfg, dispatcher).await.unwrap();
    let stream = TcpStream::connect(handle.local_addr).await.unwrap();
    (handle, stream)
}

pub async fn send(stream: &mut TcpStream, request_id: i32, body: &Document) -> Document {
    let wire = protocol::encode_op_msg(body, 0, request_id).unwrap();
    stream.write_all(&wire).await.unwrap();
    read_one(stream).await
}

async fn read_one(stream: &mut TcpStream) -> Document {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let message_length = i32::from_le_bytes(len_buf) as usize;
    let mut rest = vec![0u8; message_length - 4];
    stream.read_exact(&mut rest).await.unwrap();
    let mut full = len_buf.to_vec();
    full.extend_from_slice(&rest);
    let (header, _) = MessageHeader::parse(&full).unwrap();
    assert_eq!(header.op_code, OP_MSG);
    protocol::decode_op_msg(&full).unwrap().body
}

pub fn random_string(len: usize) -> String {
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}
