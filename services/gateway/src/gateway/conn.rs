//! Per-connection context.
//!
//! The `ConnContext` exclusively owns its socket through the read and write
//! loops; everything else (session registry, outbound worker, adapters)
//! holds it only as an `Arc` and talks to the socket through the bounded
//! write queue. When the connection dies the context is marked closed and
//! every later send fails fast.

use async_trait::async_trait;
use gw_protocol::ProtocolFamily;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Bound on the per-connection write queue.
pub const WRITE_QUEUE_DEPTH: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("write queue saturated")]
    QueueFull,
    #[error("socket write timed out")]
    WriteTimeout,
    #[error("io: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// ConnWriter seam
// ---------------------------------------------------------------------------

/// What the outbound worker needs from a connection. Tests substitute a
/// recording writer; production hands out `Arc<ConnContext>`.
#[async_trait]
pub trait ConnWriter: Send + Sync {
    fn conn_id(&self) -> u64;
    fn family(&self) -> Option<ProtocolFamily>;
    fn is_closed(&self) -> bool;
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ConnError>;
}

// ---------------------------------------------------------------------------
// ConnContext
// ---------------------------------------------------------------------------

pub struct ConnContext {
    conn_id: u64,
    peer: SocketAddr,
    write_tx: mpsc::Sender<Vec<u8>>,
    write_timeout: Duration,
    closed: AtomicBool,
    family: RwLock<Option<ProtocolFamily>>,
    device_id: RwLock<Option<String>>,
}

impl ConnContext {
    /// Build a context plus the receiver its write loop drains.
    pub fn new(
        conn_id: u64,
        peer: SocketAddr,
        write_timeout: Duration,
    ) -> (std::sync::Arc<ConnContext>, mpsc::Receiver<Vec<u8>>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        (
            std::sync::Arc::new(ConnContext {
                conn_id,
                peer,
                write_tx,
                write_timeout,
                closed: AtomicBool::new(false),
                family: RwLock::new(None),
                device_id: RwLock::new(None),
            }),
            write_rx,
        )
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn set_family(&self, family: ProtocolFamily) {
        *self.family.write().unwrap() = Some(family);
    }

    pub fn set_device_id(&self, device_id: &str) {
        *self.device_id.write().unwrap() = Some(device_id.to_owned());
    }

    pub fn device_id(&self) -> Option<String> {
        self.device_id.read().unwrap().clone()
    }
}

#[async_trait]
impl ConnWriter for ConnContext {
    fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn family(&self) -> Option<ProtocolFamily> {
        *self.family.read().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue bytes for the write loop with a bounded wait; the socket
    /// write itself happens on the write-loop task.
    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        match self.write_tx.send_timeout(bytes, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(ConnError::QueueFull),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ConnError::Closed),
        }
    }
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Drain the write queue onto the socket. When `done` flips (the read loop
/// finished), the queue stops accepting new frames but everything already
/// buffered is still written before the socket shuts down, so a graceful
/// stop never drops queued replies. Returns when the queue is drained or a
/// write fails; the caller releases its admission permit only after this
/// resolves.
pub async fn run_write_loop(
    mut write_half: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    mut done: watch::Receiver<bool>,
) -> Result<(), ConnError> {
    let mut draining = false;
    let result = loop {
        tokio::select! {
            biased;
            changed = done.changed(), if !draining => {
                if changed.is_err() || *done.borrow() {
                    draining = true;
                    write_rx.close();
                }
            }
            maybe = write_rx.recv() => {
                match maybe {
                    Some(bytes) => {
                        match tokio::time::timeout(write_timeout, write_half.write_all(&bytes)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break Err(ConnError::Io(e.to_string())),
                            Err(_) => break Err(ConnError::WriteTimeout),
                        }
                    }
                    None => {
                        debug!("write queue drained, write loop exiting");
                        break Ok(());
                    }
                }
            }
        }
    };
    let _ = write_half.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_conn() -> (Arc<ConnContext>, mpsc::Receiver<Vec<u8>>) {
        ConnContext::new(
            1,
            "127.0.0.1:9999".parse().unwrap(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn send_lands_in_write_queue() {
        let (conn, mut rx) = test_conn();
        conn.send_bytes(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_conn_rejects_sends() {
        let (conn, _rx) = test_conn();
        conn.mark_closed();
        assert!(matches!(
            conn.send_bytes(vec![1]).await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn saturated_queue_times_out() {
        let (conn, _rx) = test_conn();
        for _ in 0..WRITE_QUEUE_DEPTH {
            conn.send_bytes(vec![0]).await.unwrap();
        }
        assert!(matches!(
            conn.send_bytes(vec![0]).await,
            Err(ConnError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn family_and_device_are_recorded_once_known() {
        let (conn, _rx) = test_conn();
        assert_eq!(conn.family(), None);
        conn.set_family(ProtocolFamily::B);
        conn.set_device_id("82241218000382");
        assert_eq!(conn.family(), Some(ProtocolFamily::B));
        assert_eq!(conn.device_id().as_deref(), Some("82241218000382"));
    }
}
