//! # Callback Bridge
//!
//! Host functions the foreign side may call back into.
//!
//! ## Invariants
//! - Every invocation runs on its own task. The pump that received it keeps
//!   reading, so a callback that calls back into the foreign side (and from
//!   there into another callback) cannot deadlock the connection.
//! - Unknown ids and wrong argument counts are reported to the caller as
//!   errors. They never take down the bridge.
//! - While a callback runs, calls it makes on the invoking session reuse the
//!   worker that invoked it (see `Reentry`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as Json;
use tagpack::CallbackRef;
use tagpack::SymbolTable;
use tagpack::Value;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::pool::WorkerId;

/// What a callback handler receives.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The session of the foreign call that invoked the callback.
    pub session_id: String,
    pub args: Vec<Value>,
}

type Handler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    arity: Option<usize>,
    handler: Handler,
}

/// The worker a callback invocation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub pool: String,
    pub worker: WorkerId,
}

/// The worker and session a running callback was invoked from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reentry {
    pub session_id: String,
    pub origin: Origin,
}

tokio::task_local! {
    static REENTRY: Reentry;
}

/// The invocation context of the callback running on the current task, if any.
pub(crate) fn current_reentry() -> Option<Reentry> {
    REENTRY.try_with(Clone::clone).ok()
}

pub struct CallbackRegistry {
    callbacks: DashMap<String, Registration>,
    symbols: SymbolTable,
    timeout: Duration,
}

impl CallbackRegistry {
    pub fn new(symbols: SymbolTable, timeout: Duration) -> Self {
        Self {
            callbacks: DashMap::new(),
            symbols,
            timeout,
        }
    }

    /// Registers an async handler. `arity` of `None` accepts any argument count.
    pub fn register<F, Fut>(&self, arity: Option<usize>, handler: F) -> CallbackRef
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let handler: Handler = Arc::new(move |invocation| handler(invocation).boxed());
        self.callbacks.insert(id.clone(), Registration { arity, handler });
        debug!(callback_id = %id, ?arity, "registered callback");
        CallbackRef { id, arity }
    }

    /// Registers a plain function of its arguments.
    pub fn register_fn<F>(&self, arity: Option<usize>, f: F) -> CallbackRef
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(arity, move |invocation: Invocation| {
            let f = f.clone();
            async move { f(invocation.args) }
        })
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.callbacks.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Runs a callback for an `invoke` frame and encodes its result.
    pub(crate) async fn dispatch(
        &self,
        origin: Origin,
        session_id: String,
        callback_id: &str,
        args: Vec<Json>,
    ) -> Result<Json> {
        let registration = self
            .callbacks
            .get(callback_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::CallbackNotFound(callback_id.to_string()))?;

        if let Some(expected) = registration.arity {
            if expected != args.len() {
                return Err(Error::ArityMismatch {
                    callback_id: callback_id.to_string(),
                    expected,
                    got: args.len(),
                });
            }
        }

        let args = args
            .iter()
            .map(|arg| tagpack::decode(arg, &self.symbols))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(callback_id, session_id = %session_id, worker = %origin.worker, "dispatching callback");

        let reentry = Reentry {
            session_id: session_id.clone(),
            origin,
        };
        let invocation = Invocation { session_id, args };
        let running = REENTRY.scope(reentry, (registration.handler)(invocation));

        let value = tokio::time::timeout(self.timeout, running)
            .await
            .map_err(|_| Error::Timeout)??;

        Ok(tagpack::encode(&value)?)
    }
}
