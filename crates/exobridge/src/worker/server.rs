//! The worker's serve loop.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Map;
use serde_json::Value as Json;
use tagpack::SymbolTable;
use tagpack::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

use super::CallScope;
use super::Interpreter;
use super::Kwargs;
use super::encode::RefEncoder;
use super::encode::resolve_refs;
use super::encode::target_id;
use crate::config::WorkerConfig;
use crate::error::Error;
use crate::error::Result;
use crate::frame::CallType;
use crate::frame::Envelope;
use crate::frame::Frame;
use crate::frame::FrameHead;
use crate::frame::Outcome;
use crate::registry::Registry;
use crate::transport;
use crate::transport::Transport;

/// The worker's connection to the host, shared by every call in flight.
pub(crate) struct Link {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry<Value>>,
    symbols: SymbolTable,
    pending: DashMap<u64, oneshot::Sender<Result<Json>>>,
    seq_gen: AtomicU64,
    callback_timeout: Duration,
}

impl Link {
    async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        self.transport.send(&bytes).await.map_err(Error::from)
    }

    fn decode(&self, json: &Json, session_id: &str) -> Result<Value> {
        let value = tagpack::decode(json, &self.symbols)?;
        resolve_refs(value, &self.registry, session_id)
    }

    fn decode_args(&self, args: &[Json], session_id: &str) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.decode(arg, session_id)).collect()
    }

    fn decode_kwargs(&self, kwargs: &Map<String, Json>, session_id: &str) -> Result<Kwargs> {
        kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.decode(v, session_id)?)))
            .collect()
    }

    fn resolve_target(&self, envelope: &Envelope) -> Result<Value> {
        let target = envelope
            .target
            .as_ref()
            .ok_or_else(|| Error::InvalidEnvelope(format!("{} needs a target", envelope.call_type.as_str())))?;
        let id = target_id(target, &self.symbols)?;
        Ok(self.registry.resolve(&envelope.session_id, &id)?)
    }

    /// Sends an `invoke` frame and waits for the host's answer.
    pub(crate) async fn invoke(
        &self,
        session_id: &str,
        pool_name: Option<&str>,
        library: &str,
        callback_id: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let args = args
            .iter()
            .map(|arg| RefEncoder::new(&self.registry, session_id, pool_name, library).encode(arg))
            .collect::<Result<Vec<_>>>()?;

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let frame = Frame::Invoke {
            seq,
            session_id: session_id.to_string(),
            callback_id: callback_id.to_string(),
            args,
        };
        if let Err(e) = self.send(&frame).await {
            self.pending.remove(&seq);
            return Err(e);
        }

        let json = match tokio::time::timeout(self.callback_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                self.pending.remove(&seq);
                return Err(Error::Protocol("Callback reply channel closed".into()));
            }
            Err(_) => {
                self.pending.remove(&seq);
                return Err(Error::Timeout);
            }
        };

        self.decode(&json, session_id)
    }

    fn fail_pending(&self, error: Error) {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

/// Serves one host connection with one interpreter.
pub struct WorkerServer {
    interpreter: Arc<dyn Interpreter>,
    config: WorkerConfig,
}

/// A running worker.
pub struct WorkerHandle {
    registry: Arc<Registry<Value>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// The worker's live objects.
    pub fn registry(&self) -> &Arc<Registry<Value>> {
        &self.registry
    }

    /// Stops serving. Calls in flight on the host side fail with a transport error.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl WorkerServer {
    pub fn new(interpreter: impl Interpreter, config: WorkerConfig) -> Self {
        Self {
            interpreter: Arc::new(interpreter),
            config,
        }
    }

    /// Spawns the serve loop on the current tokio runtime.
    pub fn spawn(self, transport: impl Transport) -> WorkerHandle {
        let registry = Arc::new(Registry::new(self.config.limits));
        let link = Arc::new(Link {
            transport: Arc::new(transport),
            registry: registry.clone(),
            symbols: self.config.symbol_table(),
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            callback_timeout: self.config.callback_timeout(),
        });

        let task = tokio::spawn(Self::run(link, self.interpreter, self.config.prune_interval()));
        WorkerHandle { registry, task }
    }

    async fn run(link: Arc<Link>, interpreter: Arc<dyn Interpreter>, prune_every: Duration) {
        let mut prune = tokio::time::interval(prune_every.max(Duration::from_millis(1)));
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let error = loop {
            tokio::select! {
                received = link.transport.recv() => match received {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&link, &interpreter, &msg) {
                            warn!(error = %e, "discarding frame from host");
                            Self::reject(&link, &msg, e).await;
                        }
                    }
                    Ok(None) => {
                        debug!("host hung up");
                        break Error::Transport(transport::Error::ConnectionLost("Stream closed".into()));
                    }
                    Err(e) => {
                        warn!(error = %e, "transport error in worker loop");
                        break Error::Transport(e);
                    }
                },
                _ = prune.tick() => {
                    let pruned = link.registry.prune();
                    if pruned > 0 {
                        debug!(pruned, live = link.registry.len(), "pruned expired refs");
                    }
                }
            }
        };

        link.fail_pending(error);
    }

    /// Fails the call a malformed frame belongs to, if it can be told.
    async fn reject(link: &Link, msg: &[u8], error: Error) {
        let Some(head) = FrameHead::peek(msg) else {
            return;
        };
        match head.frame.as_str() {
            "call" => {
                let reply = Frame::Reply {
                    seq: head.seq,
                    result: Outcome::Error { error: error.to_wire() },
                };
                if let Err(e) = link.send(&reply).await {
                    warn!(seq = head.seq, error = %e, "failed to reject call");
                }
            }
            "invoke_reply" => {
                if let Some((_, tx)) = link.pending.remove(&head.seq) {
                    let _ = tx.send(Err(error));
                }
            }
            _ => {}
        }
    }

    fn handle_message(link: &Arc<Link>, interpreter: &Arc<dyn Interpreter>, msg: &[u8]) -> Result<()> {
        match Frame::from_bytes(msg)? {
            Frame::Call { seq, envelope } => {
                let link = link.clone();
                let interpreter = interpreter.clone();

                tokio::spawn(async move {
                    let call_type = envelope.call_type;
                    let result = Self::handle_call(&link, interpreter.as_ref(), envelope).await;
                    if let Err(e) = &result {
                        debug!(seq, call_type = call_type.as_str(), error = %e, "call failed");
                    }

                    let reply = Frame::Reply { seq, result: Outcome::from(result) };
                    if let Err(e) = link.send(&reply).await {
                        warn!(seq, error = %e, "failed to send reply");
                    }
                });
                Ok(())
            }
            Frame::InvokeReply { seq, result } => {
                if let Some((_, tx)) = link.pending.remove(&seq) {
                    let _ = tx.send(result.into_result());
                }
                Ok(())
            }
            Frame::Reply { .. } | Frame::Invoke { .. } => {
                Err(Error::Protocol("worker received a host-bound frame".into()))
            }
        }
    }

    async fn handle_call(link: &Arc<Link>, interpreter: &dyn Interpreter, envelope: Envelope) -> Result<Json> {
        let session_id = envelope.session_id.as_str();
        if session_id.is_empty() {
            return Err(Error::InvalidEnvelope("missing session_id".into()));
        }
        if let Some(limits) = envelope.limits {
            link.registry.configure_session(session_id, limits);
        }

        let scope = CallScope::new(
            session_id.to_string(),
            envelope.library.clone(),
            envelope.pool_name.clone(),
            link.clone(),
        );

        let function = || {
            envelope
                .function
                .as_deref()
                .ok_or_else(|| Error::InvalidEnvelope(format!("{} needs a function", envelope.call_type.as_str())))
        };
        let attr = || {
            envelope
                .attr
                .as_deref()
                .ok_or_else(|| Error::InvalidEnvelope(format!("{} needs an attr", envelope.call_type.as_str())))
        };

        let value = match envelope.call_type {
            CallType::DynamicCall => {
                let args = link.decode_args(&envelope.args, session_id)?;
                let kwargs = link.decode_kwargs(&envelope.kwargs, session_id)?;
                interpreter.call(&scope, &envelope.source_module, function()?, args, kwargs).await?
            }
            CallType::ModuleAttr => interpreter.module_attr(&scope, &envelope.source_module, attr()?).await?,
            CallType::MethodCall => {
                let target = link.resolve_target(&envelope)?;
                let args = link.decode_args(&envelope.args, session_id)?;
                let kwargs = link.decode_kwargs(&envelope.kwargs, session_id)?;
                interpreter.call_method(&scope, &target, function()?, args, kwargs).await?
            }
            CallType::AttrGet => {
                let target = link.resolve_target(&envelope)?;
                interpreter.get_attr(&scope, &target, attr()?).await?
            }
            CallType::AttrSet => {
                let target = link.resolve_target(&envelope)?;
                let value = match &envelope.value {
                    Some(json) => link.decode(json, session_id)?,
                    None => Value::None,
                };
                interpreter.set_attr(&scope, &target, attr()?, value).await?;
                Value::None
            }
            CallType::StreamNext => {
                let target = link.resolve_target(&envelope)?;
                interpreter.next(&scope, &target).await?.ok_or(Error::StreamExhausted)?
            }
            CallType::ReleaseRef => {
                let target = envelope
                    .target
                    .as_ref()
                    .ok_or_else(|| Error::InvalidEnvelope("release_ref needs a target".into()))?;
                let id = target_id(target, &link.symbols)?;
                let released = link.registry.release(session_id, &id);
                debug!(session_id, ref_id = %id, released, "release_ref");
                Value::None
            }
            CallType::ReleaseSession => {
                let released = link.registry.release_session(session_id);
                debug!(session_id, released, "release_session");
                Value::None
            }
        };

        RefEncoder::new(&link.registry, session_id, envelope.pool_name.as_deref(), &envelope.library).encode(&value)
    }
}
