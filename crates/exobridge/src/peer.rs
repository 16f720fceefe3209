//! # Worker Peer with Async Pump
//!
//! The host end of one worker connection. A background pump task reads every
//! incoming frame: replies are correlated with pending calls by sequence
//! number, callback invocations are handed to the `CallbackRegistry` on tasks
//! of their own so a slow or recursive callback never stalls the pump.
//!
//! A frame that fails to parse costs only the call it belongs to. The pump
//! stops when the transport does, and from then on the peer reports itself
//! closed so the router stops picking it.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::callback::CallbackRegistry;
use crate::callback::Origin;
use crate::error::Error;
use crate::error::Result;
use crate::frame::Envelope;
use crate::frame::Frame;
use crate::frame::FrameHead;
use crate::frame::Outcome;
use crate::transport;
use crate::transport::Transport;

type Pending = DashMap<u64, oneshot::Sender<Result<Json>>>;

/// Connection to a single worker.
///
/// Each Peer owns its transport exclusively, so sequence numbers are scoped to
/// one worker.
pub struct Peer {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Pending>,
    seq_gen: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl Peer {
    /// Creates a new peer and spawns the background pump task.
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        callbacks: Arc<CallbackRegistry>,
        origin: Origin,
    ) -> Self {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_closed = closed.clone();
        let pump_name = name.clone();

        tokio::spawn(async move {
            let error = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        let handled = Self::handle_message(&msg, &pump_pending, &pump_transport, &callbacks, &origin);
                        if let Err(e) = handled {
                            warn!(peer = %pump_name, error = %e, "discarding frame from worker");
                            Self::reject(&msg, e, &pump_pending, &pump_transport).await;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %pump_name, "worker hung up");
                        break Error::Transport(transport::Error::ConnectionLost("Stream closed".into()));
                    }
                    Err(e) => {
                        warn!(peer = %pump_name, error = %e, "transport error in pump");
                        break Error::Transport(e);
                    }
                }
            };

            pump_closed.store(true, Ordering::Release);
            Self::notify_all_pending(&pump_pending, error);
        });

        Self {
            name,
            transport,
            pending,
            seq_gen: AtomicU64::new(1),
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the pump has stopped. A closed peer never answers again.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hands a frame's failure to whoever is waiting on it: the pending call
    /// for a reply, the worker for an invoke.
    async fn reject(msg: &[u8], error: Error, pending: &Pending, transport: &Arc<dyn Transport>) {
        let Some(head) = FrameHead::peek(msg) else {
            return;
        };
        match head.frame.as_str() {
            "reply" => {
                if let Some((_, tx)) = pending.remove(&head.seq) {
                    let _ = tx.send(Err(error));
                }
            }
            "invoke" => {
                let reply = Frame::InvokeReply {
                    seq: head.seq,
                    result: Outcome::Error { error: error.to_wire() },
                };
                if let Ok(bytes) = reply.to_bytes() {
                    if let Err(e) = transport.send(&bytes).await {
                        warn!(seq = head.seq, error = %e, "failed to reject invoke");
                    }
                }
            }
            _ => {}
        }
    }

    /// Fails every waiting call with the given error.
    fn notify_all_pending(pending: &Pending, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    fn handle_message(
        msg: &[u8],
        pending: &Pending,
        transport: &Arc<dyn Transport>,
        callbacks: &Arc<CallbackRegistry>,
        origin: &Origin,
    ) -> Result<()> {
        match Frame::from_bytes(msg)? {
            Frame::Reply { seq, result } => {
                // a reply nobody waits for is a call that already timed out
                if let Some((_, tx)) = pending.remove(&seq) {
                    let _ = tx.send(result.into_result());
                }
                Ok(())
            }
            Frame::Invoke { seq, session_id, callback_id, args } => {
                let transport = transport.clone();
                let callbacks = callbacks.clone();
                let origin = origin.clone();

                tokio::spawn(async move {
                    let result = callbacks.dispatch(origin, session_id, &callback_id, args).await;
                    if let Err(e) = &result {
                        debug!(callback_id = %callback_id, error = %e, "callback failed");
                    }

                    let reply = Frame::InvokeReply { seq, result: Outcome::from(result) };
                    match reply.to_bytes() {
                        Ok(bytes) => {
                            if let Err(e) = transport.send(&bytes).await {
                                warn!(callback_id = %callback_id, error = %e, "failed to send callback reply");
                            }
                        }
                        Err(e) => warn!(callback_id = %callback_id, error = %e, "failed to encode callback reply"),
                    }
                });
                Ok(())
            }
            Frame::Call { .. } | Frame::InvokeReply { .. } => {
                Err(Error::Protocol("host received a worker-bound frame".into()))
            }
        }
    }

    /// Sends an envelope and awaits the reply until `deadline`.
    pub async fn call(&self, envelope: Envelope, deadline: Instant) -> Result<Json> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        debug!(peer = %self.name, seq, call_type = envelope.call_type.as_str(), name = envelope.name(), "call");

        let payload = match (Frame::Call { seq, envelope }).to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.pending.remove(&seq);
                return Err(e);
            }
        };

        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&seq);
                Err(Error::Protocol("Response channel closed".into()))
            }
            Err(_) => {
                self.pending.remove(&seq);
                Err(Error::Timeout)
            }
        }
    }

    /// Number of calls awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
