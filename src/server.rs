//! TCP accept loop and per-connection worker. Frames wire messages via
//! `protocol`, decodes each to a command document, and drives a
//! `dispatch::Dispatcher` to produce the response. `run`/`handle_connection`
//! follow the bounded-retry accept loop shape, generalized from a
//! single-shot drain-and-close stub into one with real dispatch.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{self, MessageHeader, OP_MSG, OP_QUERY};
use bytes::BytesMut;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A running server: its bound local address plus the means to request and
/// await a clean shutdown. Returned by `spawn_with_shutdown`, which both the
/// launcher and end-to-end tests use as their single entry point.
pub struct Handle {
    pub local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl Handle {
    /// Flip `running=false`, wake the accept loop, and join it with a
    /// bounded deadline. Each worker exits at its next I/O boundary on its
    /// own; this only ensures the accept task itself has stopped.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.accept_task).await;
    }
}

/// Bind `cfg.host:cfg.port` (port 0 for an ephemeral port) and spawn the
/// accept loop. Returns as soon as the listener is bound; the caller reads
/// `handle.local_addr` for the actual bound port.
pub async fn spawn_with_shutdown(cfg: Config, dispatcher: Arc<Dispatcher>) -> Result<Handle> {
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "jongodb listening");

    let running = Arc::new(AtomicBool::new(true));
    let notify = Arc::new(Notify::new());
    let sockets: Arc<Mutex<HashSet<SocketAddr>>> = Arc::new(Mutex::new(HashSet::new()));

    let accept_task = tokio::spawn(accept_loop(
        listener,
        dispatcher,
        cfg,
        running.clone(),
        notify.clone(),
        sockets,
    ));

    Ok(Handle {
        local_addr,
        running,
        notify,
        accept_task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    cfg: Config,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    sockets: Arc<Mutex<HashSet<SocketAddr>>>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = notify.notified() => break,
        };

        let (socket, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                consecutive_failures += 1;
                tracing::warn!(error = %e, consecutive_failures, "accept failed");
                if consecutive_failures >= cfg.max_consecutive_accept_failures {
                    tracing::error!("too many consecutive accept failures, stopping accept loop");
                    break;
                }
                let shift = consecutive_failures.saturating_sub(1).min(32);
                let backoff_ms = cfg
                    .accept_backoff_base_ms
                    .saturating_mul(1u64 << shift)
                    .min(cfg.accept_backoff_max_ms);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                continue;
            }
        };

        consecutive_failures = 0;
        let _ = socket.set_nodelay(true);
        sockets.lock().unwrap().insert(addr);
        tracing::debug!(%addr, "accepted connection");

        let dispatcher = dispatcher.clone();
        let running = running.clone();
        let sockets = sockets.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, dispatcher, running).await {
                tracing::debug!(%addr, error = %e, "connection closed with error");
            }
            sockets.lock().unwrap().remove(&addr);
        });
    }

    // Best-effort: nothing to actively close here, live sockets are owned by
    // their worker tasks and closed on the worker's own exit path.
    let _ = sockets.lock().unwrap();
}

async fn handle_connection(mut socket: TcpStream, dispatcher: Arc<Dispatcher>, running: Arc<AtomicBool>) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 8192];

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let frame = 'read: loop {
            if let Some(frame) = protocol::try_take_frame(&mut buf)? {
                break 'read Some(frame);
            }
            let n = socket.read(&mut read_buf).await?;
            if n == 0 {
                break 'read None;
            }
            buf.extend_from_slice(&read_buf[..n]);
        };

        let Some(frame) = frame else {
            break;
        };

        let (header, _) = MessageHeader::parse(&frame)
            .ok_or_else(|| Error::Protocol(ProtocolError::Framing("frame shorter than header".into())))?;

        match header.op_code {
            OP_MSG => {
                let op_msg = protocol::decode_op_msg(&frame)?;
                let response = dispatcher.dispatch(op_msg.body).await;
                let request_id = protocol::next_request_id();
                let out = protocol::encode_op_msg(&response, header.request_id, request_id)?;
                socket.write_all(&out).await?;
            }
            OP_QUERY => {
                let (_, full_collection_name, _, _, mut body) = protocol::decode_op_query(&frame[MessageHeader::SIZE..])?;
                inject_db_from_namespace(&mut body, &full_collection_name);
                let response = dispatcher.dispatch(body).await;
                let request_id = protocol::next_request_id();
                let out = protocol::encode_op_reply(&response, header.request_id, request_id)?;
                socket.write_all(&out).await?;
            }
            other => return Err(Error::Protocol(ProtocolError::UnsupportedOpcode(other))),
        }
    }

    let _ = socket.shutdown().await;
    Ok(())
}

/// Inject `$db` from the OP_QUERY full collection name (`db.collection`)
/// only when the query document doesn't already carry one; a conflicting
/// driver-supplied `$db` is kept as-is and only logged.
fn inject_db_from_namespace(body: &mut bson::Document, full_collection_name: &str) {
    let Some((db, _)) = full_collection_name.split_once('.') else {
        return;
    };
    match body.get_str("$db").ok().map(|s| s.to_string()) {
        Some(existing) if existing != db => {
            tracing::debug!(existing = %existing, namespace_db = db, "OP_QUERY $db mismatch, keeping driver-supplied $db");
        }
        Some(_) => {}
        None => {
            body.insert("$db", db);
        }
    }
}
