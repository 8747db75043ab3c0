//! Transport boundary
//!
//! The stack talks to a controller through this trait: opaque byte buffers
//! out, opaque byte chunks in. No framing is assumed at this level — the
//! frame codec above it tolerates arbitrary chunking. Implementations live
//! outside the core (serial, USB, sockets); the in-memory pipe here exists
//! for tests and in-process virtual controllers.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Transport-level failures
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The transport is gone; every dependent connection must be torn down
    #[error("Transport closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// A duplex byte-stream to a controller.
///
/// `read_chunk` returns the next inbound chunk, suspending until one is
/// available; `Err(TransportError::Closed)` means the link is lost.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn read_chunk(&self) -> Result<Vec<u8>, TransportError>;
}

/// In-memory duplex pipe.
///
/// `pair()` returns two connected endpoints: bytes written on one side come
/// out of `read_chunk` on the other, preserving chunk boundaries and order.
pub struct PipeTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl PipeTransport {
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PipeTransport {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            PipeTransport {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}
