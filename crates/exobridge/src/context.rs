//! Caller contexts: the owners that implicit and explicit sessions are tied to.
//!
//! A context is alive as long as any clone of it is. When the last clone is
//! dropped its owner channel closes, and the bridge releases every session the
//! context owned.

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::watch;

struct ContextInner {
    id: String,
    session_id: Option<String>,
    owner: watch::Sender<()>,
}

/// The identity of a caller.
///
/// Calls made through the same context share one implicit session, created
/// lazily on the first call.
#[derive(Clone)]
pub struct CallerContext {
    inner: Arc<ContextInner>,
}

impl CallerContext {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub(crate) fn bound(session_id: String) -> Self {
        Self::build(Some(session_id))
    }

    fn build(session_id: Option<String>) -> Self {
        let (owner, _) = watch::channel(());
        Self {
            inner: Arc::new(ContextInner {
                id: uuid::Uuid::new_v4().to_string(),
                session_id,
                owner,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The explicit session this context is bound to, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    /// A receiver whose `changed()` fails once every clone of this context is gone.
    pub(crate) fn owner_watch(&self) -> watch::Receiver<()> {
        self.inner.owner.subscribe()
    }
}

impl Default for CallerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerContext")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .finish()
    }
}

/// An explicit session, released when the scope (and every context cloned
/// from it) is dropped.
#[derive(Debug)]
pub struct SessionScope {
    context: CallerContext,
}

impl SessionScope {
    pub(crate) fn new(context: CallerContext) -> Self {
        Self { context }
    }

    pub fn id(&self) -> &str {
        self.context.session_id().unwrap_or_default()
    }

    pub fn context(&self) -> &CallerContext {
        &self.context
    }
}

impl Deref for SessionScope {
    type Target = CallerContext;

    fn deref(&self) -> &CallerContext {
        &self.context
    }
}
