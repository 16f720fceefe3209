//! # Bridge
//!
//! The host-facing facade. Encodes arguments, resolves the caller's session,
//! routes the call to a worker, and decodes what comes back.
//!
//! ## Invariants
//! - Arguments are encoded before anything else happens, so an unencodable
//!   argument never costs a round trip.
//! - A worker slot is held only for the round trip and is given back on every
//!   exit path, timeouts included.
//! - The bridge is cheap to clone and safe to share. The only shared mutable
//!   state lives in the session manager, the pools and the cache, each behind
//!   its own operations.

use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Map;
use serde_json::Value as Json;
use tagpack::CallbackRef;
use tagpack::Ref;
use tagpack::StreamRef;
use tagpack::SymbolTable;
use tagpack::Value;
use tagpack::codec::encode_ref;
use tagpack::codec::encode_stream_ref;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::builder::BridgeBuilder;
use crate::cache::ResponseCache;
use crate::callback;
use crate::callback::CallbackRegistry;
use crate::callback::Invocation;
use crate::callback::Origin;
use crate::config::BridgeConfig;
use crate::context::CallerContext;
use crate::context::SessionScope;
use crate::error::Error;
use crate::error::Result;
use crate::frame::CallType;
use crate::frame::Envelope;
use crate::options::CallOptions;
use crate::peer::Peer;
use crate::pool::Checkout;
use crate::pool::Pool;
use crate::pool::Worker;
use crate::pool::WorkerId;
use crate::router;
use crate::session::SessionInfo;
use crate::session::SessionManager;
use crate::session::SessionOptions;
use crate::stream::RefStream;
use crate::stream::StreamItem;
use crate::transport::Transport;
use crate::worker::Kwargs;

/// A call of a foreign module-level function.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub library: String,
    pub module: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Call {
    /// A call of `module.function`. The library defaults to the top-level
    /// package of the module path.
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        let module = module.into();
        let library = module.split('.').next().unwrap_or_default().to_string();
        Self {
            library,
            module,
            function: function.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn library(mut self, library: impl Into<String>) -> Self {
        self.library = library.into();
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// The ref a call operates on, as far as routing is concerned.
#[derive(Clone, Copy, Debug)]
struct Target<'a> {
    id: &'a str,
    session_id: &'a str,
}

impl<'a> From<&'a Ref> for Target<'a> {
    fn from(r: &'a Ref) -> Self {
        Self {
            id: &r.id,
            session_id: &r.session_id,
        }
    }
}

impl<'a> From<&'a StreamRef> for Target<'a> {
    fn from(s: &'a StreamRef) -> Self {
        Self {
            id: &s.id,
            session_id: &s.session_id,
        }
    }
}

struct Inner {
    config: BridgeConfig,
    symbols: SymbolTable,
    pools: DashMap<String, Arc<Pool>>,
    sessions: SessionManager,
    callbacks: Arc<CallbackRegistry>,
    cache: ResponseCache,
    next_worker: AtomicU64,
}

/// Handle to the bridge. Clones share state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    pub(crate) fn from_config(config: BridgeConfig) -> Self {
        let symbols = config.symbol_table();
        let callbacks = Arc::new(CallbackRegistry::new(symbols.clone(), config.callback_timeout()));
        let cache = ResponseCache::new(config.cache_capacity);
        let sessions = SessionManager::new(config.session_limits());

        Self {
            inner: Arc::new(Inner {
                config,
                symbols,
                pools: DashMap::new(),
                sessions,
                callbacks,
                cache,
                next_worker: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // ========================================================================
    //  POOLS
    // ========================================================================

    /// Declares an empty pool. Existing pools are left alone.
    pub fn add_pool(&self, name: &str) -> Arc<Pool> {
        self.inner
            .pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Pool::new(name)))
            .value()
            .clone()
    }

    /// Connects a worker and adds it to a pool. Must run inside a tokio runtime.
    pub fn add_worker(&self, pool_name: &str, transport: Box<dyn Transport>) -> WorkerId {
        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::Relaxed));
        let origin = Origin {
            pool: pool_name.to_string(),
            worker: id,
        };
        let peer = Peer::new(id.to_string(), transport, self.inner.callbacks.clone(), origin);
        self.add_pool(pool_name).insert(Worker::new(id, pool_name, peer));
        id
    }

    pub fn pool(&self, name: &str) -> Result<Arc<Pool>> {
        self.inner
            .pools
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    fn find_worker(&self, id: WorkerId) -> Option<Arc<Pool>> {
        self.inner
            .pools
            .iter()
            .find(|p| p.get(id).is_some())
            .map(|p| p.value().clone())
    }

    pub fn taint_worker(&self, id: WorkerId) -> bool {
        self.find_worker(id).is_some_and(|pool| pool.taint(id))
    }

    pub fn restore_worker(&self, id: WorkerId) -> bool {
        self.find_worker(id).is_some_and(|pool| pool.restore(id))
    }

    pub fn remove_worker(&self, id: WorkerId) -> bool {
        self.find_worker(id).is_some_and(|pool| pool.remove(id).is_some())
    }

    // ========================================================================
    //  SESSIONS
    // ========================================================================

    /// A fresh caller context with no session yet.
    pub fn context(&self) -> CallerContext {
        CallerContext::new()
    }

    /// Opens an explicit session, released when the returned scope is dropped.
    ///
    /// The id must not name a session that is still open.
    pub fn with_session(&self, session_id: impl Into<String>, options: SessionOptions) -> Result<SessionScope> {
        let session_id = session_id.into();
        if !self.inner.sessions.open(&session_id, options)? {
            return Err(Error::SessionExists(session_id));
        }
        let context = CallerContext::bound(session_id.clone());
        self.watch_owner(&context, session_id);
        Ok(SessionScope::new(context))
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.sessions.info(session_id)
    }

    /// Releases a session on every worker it touched, then forgets it.
    ///
    /// New calls in the session are refused at once. Calls already running are
    /// waited for, so objects they create go with the session. Idempotent.
    /// Worker failures are logged and otherwise ignored.
    pub async fn release_session(&self, session_id: &str) -> Result<()> {
        if !self.inner.sessions.begin_release(session_id) {
            return Ok(());
        }

        // a callback of one of those calls would be waiting on itself
        let nested = callback::current_reentry().is_some_and(|r| r.session_id == session_id);
        if !nested {
            self.inner.sessions.drained(session_id).await;
        }

        let workers = self.inner.sessions.release_targets(session_id);
        for (pool_name, worker_id) in workers {
            let Some(worker) = self.pool(&pool_name).ok().and_then(|p| p.get(worker_id)) else {
                debug!(session_id, worker = %worker_id, "worker gone, nothing to release");
                continue;
            };

            let mut envelope = Envelope::new(CallType::ReleaseSession);
            envelope.session_id = session_id.to_string();
            envelope.pool_name = Some(pool_name);

            let deadline = Instant::now() + self.inner.config.callback_timeout();
            if let Err(e) = worker.peer().call(envelope, deadline).await {
                warn!(session_id, worker = %worker_id, error = %e, "failed to release session on worker");
            }
        }

        self.inner.sessions.finish_release(session_id);
        self.inner.cache.forget_session(session_id);
        info!(session_id, "session released");
        Ok(())
    }

    /// Releases the session when every clone of `context` is gone.
    fn watch_owner(&self, context: &CallerContext, session_id: String) {
        let mut owner = context.owner_watch();
        let bridge: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while owner.changed().await.is_ok() {}

            let Some(inner) = bridge.upgrade() else {
                return;
            };
            debug!(session_id = %session_id, "session owner gone");
            if let Err(e) = (Bridge { inner }).release_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to release session of finished owner");
            }
        });
    }

    fn resolve_session(&self, context: &CallerContext, options: &CallOptions) -> Result<String> {
        if let Some(session_id) = &options.session_id {
            // a session created here belongs to the caller that named it first
            if self.inner.sessions.ensure(session_id)? {
                self.watch_owner(context, session_id.clone());
            }
            return Ok(session_id.clone());
        }

        if let Some(session_id) = context.session_id() {
            self.inner.sessions.check_active(session_id)?;
            return Ok(session_id.to_string());
        }

        // calls made from a callback join the session that invoked it
        if let Some(reentry) = callback::current_reentry() {
            self.inner.sessions.check_active(&reentry.session_id)?;
            return Ok(reentry.session_id);
        }

        let (session_id, created) = self.inner.sessions.implicit_for(context.id());
        if created {
            self.watch_owner(context, session_id.clone());
        }
        Ok(session_id)
    }

    // ========================================================================
    //  CALLBACKS
    // ========================================================================

    /// Registers an async callback. `arity` of `None` accepts any argument count.
    pub fn register_callback<F, Fut>(&self, arity: Option<usize>, handler: F) -> CallbackRef
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.inner.callbacks.register(arity, handler)
    }

    pub fn register_callback_fn<F>(&self, arity: Option<usize>, f: F) -> CallbackRef
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.inner.callbacks.register_fn(arity, f)
    }

    pub fn unregister_callback(&self, id: &str) -> bool {
        self.inner.callbacks.unregister(id)
    }

    // ========================================================================
    //  CALLS
    // ========================================================================

    /// Calls a foreign function.
    pub async fn call(&self, context: &CallerContext, call: Call, options: CallOptions) -> Result<Value> {
        let mut envelope = Envelope::new(CallType::DynamicCall);
        envelope.library = call.library;
        envelope.source_module = call.module;
        envelope.function = Some(call.function);
        envelope.args = encode_args(&call.args)?;
        envelope.kwargs = encode_kwargs(&call.kwargs)?;

        self.execute(context, envelope, None, &options).await
    }

    /// Runs several calls in order on one session, one result per call.
    pub async fn call_batch(
        &self,
        context: &CallerContext,
        calls: Vec<Call>,
        options: CallOptions,
    ) -> Result<Vec<Result<Value>>> {
        let session_id = self.resolve_session(context, &options)?;
        let options = CallOptions {
            session_id: Some(session_id),
            ..options
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.call(context, call, options.clone()).await);
        }
        Ok(results)
    }

    /// Reads a module-level attribute.
    pub async fn module_attr(
        &self,
        context: &CallerContext,
        module: &str,
        attr: &str,
        options: CallOptions,
    ) -> Result<Value> {
        let mut envelope = Envelope::new(CallType::ModuleAttr);
        envelope.library = module.split('.').next().unwrap_or_default().to_string();
        envelope.source_module = module.to_string();
        envelope.attr = Some(attr.to_string());

        self.execute(context, envelope, None, &options).await
    }

    /// Calls a method on a ref.
    pub async fn method_call(
        &self,
        context: &CallerContext,
        target: &Ref,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value> {
        let mut envelope = ref_envelope(CallType::MethodCall, target);
        envelope.function = Some(method.to_string());
        envelope.args = encode_args(&args)?;
        envelope.kwargs = encode_kwargs(&kwargs)?;

        self.execute(context, envelope, Some(target.into()), &options).await
    }

    /// Reads an attribute of a ref.
    pub async fn get_attr(
        &self,
        context: &CallerContext,
        target: &Ref,
        attr: &str,
        options: CallOptions,
    ) -> Result<Value> {
        let mut envelope = ref_envelope(CallType::AttrGet, target);
        envelope.attr = Some(attr.to_string());

        self.execute(context, envelope, Some(target.into()), &options).await
    }

    /// Sets an attribute of a ref.
    pub async fn set_attr(
        &self,
        context: &CallerContext,
        target: &Ref,
        attr: &str,
        value: Value,
        options: CallOptions,
    ) -> Result<()> {
        let mut envelope = ref_envelope(CallType::AttrSet, target);
        envelope.attr = Some(attr.to_string());
        envelope.value = Some(tagpack::encode(&value)?);

        self.execute(context, envelope, Some(target.into()), &options).await?;
        Ok(())
    }

    /// Drops a ref on its worker.
    pub async fn release_ref(
        &self,
        context: &CallerContext,
        target: &Ref,
        options: CallOptions,
    ) -> Result<()> {
        let envelope = ref_envelope(CallType::ReleaseRef, target);
        let options = CallOptions {
            idempotent: false,
            ..options
        };

        let session_id = self.resolve_session(context, &options)?;
        self.execute(context, envelope, Some(target.into()), &options).await?;
        self.inner.sessions.forget_ref(&session_id, &target.id);
        Ok(())
    }

    /// Pulls one item from a foreign stream.
    ///
    /// Never queues for a worker. After the end has been seen once, answers
    /// `End` without a round trip.
    pub async fn next(
        &self,
        context: &CallerContext,
        stream: &StreamRef,
        options: CallOptions,
    ) -> Result<StreamItem> {
        if stream.exhausted {
            return Ok(StreamItem::End);
        }

        let options = CallOptions {
            idempotent: false,
            ..options
        };
        let session_id = self.resolve_session(context, &options)?;
        if self.inner.sessions.is_exhausted(&session_id, &stream.id) {
            return Ok(StreamItem::End);
        }

        let mut envelope = Envelope::new(CallType::StreamNext);
        envelope.target = Some(encode_stream_ref(stream));

        let deadline = Instant::now() + self.inner.config.resolve_timeout(&options)?;
        match self.dispatch(&session_id, envelope, Some(stream.into()), &options, deadline, true).await {
            Ok(value) => Ok(StreamItem::Item(value)),
            Err(Error::StreamExhausted) => {
                self.inner.sessions.mark_exhausted(&session_id, &stream.id);
                debug!(session_id = %session_id, stream_id = %stream.id, "stream exhausted");
                Ok(StreamItem::End)
            }
            Err(e) => Err(e),
        }
    }

    /// A cursor over a foreign stream, usable as a `futures::Stream`.
    pub fn stream(&self, context: &CallerContext, stream: StreamRef, options: CallOptions) -> RefStream {
        RefStream::new(self.clone(), context.clone(), stream, options)
    }

    // ========================================================================
    //  ROUTING
    // ========================================================================

    async fn execute(
        &self,
        context: &CallerContext,
        envelope: Envelope,
        target: Option<Target<'_>>,
        options: &CallOptions,
    ) -> Result<Value> {
        let deadline = Instant::now() + self.inner.config.resolve_timeout(options)?;
        let session_id = self.resolve_session(context, options)?;
        self.dispatch(&session_id, envelope, target, options, deadline, false).await
    }

    async fn dispatch(
        &self,
        session_id: &str,
        mut envelope: Envelope,
        target: Option<Target<'_>>,
        options: &CallOptions,
        deadline: Instant,
        streaming: bool,
    ) -> Result<Value> {
        let config = &self.inner.config;
        let _in_flight = self.inner.sessions.enter(session_id)?;
        let route = self.inner.sessions.route(session_id, target.map(|t| t.id))?;

        // checked here, not on the worker: the serving worker may not hold the ref
        if let Some(target) = target.filter(|t| t.session_id != session_id) {
            return Err(Error::SessionMismatch {
                ref_id: target.id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        let pool_name = options
            .pool_name
            .clone()
            .or(route.pool_name)
            .unwrap_or_else(|| config.default_pool.clone());
        let pool = self.pool(&pool_name)?;
        let mode = options.affinity.or(route.affinity).unwrap_or(config.affinity);

        envelope.session_id = session_id.to_string();
        envelope.pool_name = Some(pool_name.clone());
        envelope.limits = Some(route.limits);

        let cache_key = if options.idempotent { ResponseCache::key(&envelope) } else { None };
        if let Some(value) = cache_key.as_deref().and_then(|key| self.inner.cache.get(key)) {
            debug!(session_id, name = envelope.name(), "served from cache");
            return Ok(value);
        }

        let checkout = match reentrant_checkout(session_id, &pool) {
            Some(checkout) => checkout,
            None if streaming => router::try_checkout(&pool, route.preferred, mode, route.pinned)?,
            None => tokio::time::timeout_at(deadline, router::checkout(&pool, route.preferred, mode))
                .await
                .map_err(|_| Error::Timeout)??,
        };

        let worker = checkout.worker().clone();
        // recorded before sending: even a call that fails may leave objects behind
        self.inner.sessions.record_worker(session_id, &pool_name, worker.id());
        let reply = worker.peer().call(envelope, deadline).await;
        drop(checkout);

        // the worker dropped it on its own (TTL, eviction)
        if let (Err(Error::RefNotFound { ref_id }), Some(target)) = (&reply, target) {
            if ref_id == target.id {
                self.inner.sessions.forget_ref(session_id, ref_id);
            }
        }
        let reply = reply?;
        let value = tagpack::decode(&reply, &self.inner.symbols)?;
        self.inner.sessions.record_success(session_id, &pool_name, worker.id(), &value);

        if let Some(key) = cache_key {
            self.inner.cache.insert(key, session_id, &value);
        }
        Ok(value)
    }
}

/// Calls made from inside a callback on the invoking session go back to the
/// worker that invoked it. Its slot is already held by the outer call.
fn reentrant_checkout(session_id: &str, pool: &Pool) -> Option<Checkout> {
    let reentry = callback::current_reentry()?;
    if reentry.session_id != session_id || reentry.origin.pool != pool.name() {
        return None;
    }
    let worker = pool.get(reentry.origin.worker)?;
    Some(Checkout::reentrant(worker, pool.freed().clone()))
}

fn ref_envelope(call_type: CallType, target: &Ref) -> Envelope {
    let mut envelope = Envelope::new(call_type);
    envelope.library = target.library.clone().unwrap_or_default();
    envelope.source_module = target.source_module.clone();
    envelope.target = Some(encode_ref(target));
    envelope
}

fn encode_args(args: &[Value]) -> Result<Vec<Json>> {
    args.iter().map(|arg| tagpack::encode(arg).map_err(Error::from)).collect()
}

fn encode_kwargs(kwargs: &Kwargs) -> Result<Map<String, Json>> {
    kwargs
        .iter()
        .map(|(k, v)| Ok((k.clone(), tagpack::encode(v)?)))
        .collect()
}
