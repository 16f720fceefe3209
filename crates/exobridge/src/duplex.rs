//! In-memory duplex transport.
//!
//! Runs a worker in the same process as the host. Used by the test suite and by
//! embedders that host the interpreter themselves.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

type Sender = mpsc::UnboundedSender<Vec<u8>>;
type Receiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// One end of an in-process frame pipe.
///
/// Frames sent on one end arrive, in order, on the other. Closing an end (or
/// dropping it) is seen by the other end as a hang-up once it has drained
/// whatever was already sent.
pub struct DuplexChannelTransport {
    tx: std::sync::Mutex<Option<Sender>>,
    rx: Mutex<Receiver>,
    sent: AtomicU64,
}

impl DuplexChannelTransport {
    /// Two connected ends: conventionally the host's first, the worker's second.
    pub fn pair() -> (Self, Self) {
        let (to_worker, from_host) = mpsc::unbounded_channel();
        let (to_host, from_worker) = mpsc::unbounded_channel();
        (Self::end(to_worker, from_worker), Self::end(to_host, from_host))
    }

    fn end(tx: Sender, rx: Receiver) -> Self {
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            sent: AtomicU64::new(0),
        }
    }

    /// Hangs up the sending half. The other end's `recv` returns `None` after
    /// draining; this end can still receive.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none_or(|tx| tx.is_closed())
    }

    /// Frames sent from this end so far.
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Option<Sender> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

impl std::fmt::Debug for DuplexChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannelTransport")
            .field("closed", &self.is_closed())
            .field("frames_sent", &self.frames_sent())
            .finish()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| transport::Error::ConnectionLost("transport closed".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("other end dropped".into()))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }
}
