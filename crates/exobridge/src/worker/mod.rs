//! # Worker Side
//!
//! The foreign end of the bridge. A `WorkerServer` owns one interpreter and one
//! reference registry, and serves call frames from a single host connection.
//!
//! ## Philosophy
//!
//! - **Interpreter-Agnostic**: The interpreter is anything implementing
//!   `Interpreter`. Live foreign objects are `Value::Opaque` handles; the server
//!   turns them into refs on the way out and back into handles on the way in.
//! - **Graceful**: A result is never rejected for containing something
//!   unencodable. Only the offending leaf becomes a ref.
//! - **Concurrent**: Each call frame runs on its own task, so a call blocked on a
//!   callback does not hold up the calls that callback makes.

mod encode;
mod server;

use std::collections::BTreeMap;
use std::sync::Arc;

use tagpack::CallbackRef;
use tagpack::Value;

use crate::error::Error;
use crate::error::Result;

pub use server::WorkerHandle;
pub use server::WorkerServer;

pub(crate) use server::Link;

/// Keyword arguments.
pub type Kwargs = BTreeMap<String, Value>;

/// A foreign interpreter.
///
/// Arguments arrive with refs already resolved to the objects they stand for.
/// Anything returned may contain `Value::Opaque` handles.
#[async_trait::async_trait]
pub trait Interpreter: Send + Sync + 'static {
    /// Calls `module.function(*args, **kwargs)`.
    async fn call(
        &self,
        scope: &CallScope,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value>;

    /// Calls `target.method(*args, **kwargs)`.
    async fn call_method(
        &self,
        scope: &CallScope,
        target: &Value,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value>;

    /// Reads `target.attr`.
    async fn get_attr(&self, scope: &CallScope, target: &Value, attr: &str) -> Result<Value>;

    /// Reads a module-level attribute.
    async fn module_attr(&self, _scope: &CallScope, module: &str, attr: &str) -> Result<Value> {
        Err(Error::foreign(
            "AttributeError",
            format!("module '{}' has no attribute '{}'", module, attr),
        ))
    }

    async fn set_attr(&self, _scope: &CallScope, _target: &Value, attr: &str, _value: Value) -> Result<()> {
        Err(Error::foreign("AttributeError", format!("can't set attribute '{}'", attr)))
    }

    /// Advances a generator or iterator. `None` means it is exhausted.
    async fn next(&self, _scope: &CallScope, _stream: &Value) -> Result<Option<Value>> {
        Err(Error::foreign("TypeError", "object is not an iterator"))
    }
}

/// The session a call runs in, and the way back to the host.
#[derive(Clone)]
pub struct CallScope {
    session_id: String,
    library: String,
    pool_name: Option<String>,
    link: Arc<Link>,
}

impl CallScope {
    pub(crate) fn new(session_id: String, library: String, pool_name: Option<String>, link: Arc<Link>) -> Self {
        Self {
            session_id,
            library,
            pool_name,
            link,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    /// Invokes a host callback and waits for its result.
    ///
    /// Opaque arguments are passed to the host as refs in this call's session.
    pub async fn invoke(&self, callback: &CallbackRef, args: Vec<Value>) -> Result<Value> {
        self.link
            .invoke(&self.session_id, self.pool_name.as_deref(), &self.library, &callback.id, args)
            .await
    }
}

impl std::fmt::Debug for CallScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallScope")
            .field("session_id", &self.session_id)
            .field("library", &self.library)
            .finish()
    }
}
