//! # Reference Registry
//!
//! The worker-side table that keeps foreign objects alive while the host holds
//! refs to them.
//!
//! ## Invariants
//! - **Ownership**: Every entry belongs to exactly one session. Resolving it
//!   under any other session is `SessionMismatch`, never `NotFound`.
//! - **Liveness**: An entry older than its session's TTL is gone, whether or not
//!   `prune()` has run yet.
//! - **Bounded**: A session never holds more than `max_refs` entries; storing
//!   past the limit evicts the least recently accessed ones first.
//! - **Closed**: Once a session is released, a call still running in it can no
//!   longer store objects there. The session opens again when the host next
//!   configures it.
//!
//! Uses DashMap so concurrent calls on one worker never serialize on the table.

use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use crate::frame::SessionLimits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NotFound(String),
    SessionMismatch { ref_id: String, session_id: String },
    SessionReleased(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Ref not found: {}", id),
            Self::SessionMismatch { ref_id, session_id } => {
                write!(f, "Ref {} is not owned by session '{}'", ref_id, session_id)
            }
            Self::SessionReleased(id) => write!(f, "Session '{}' has been released", id),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// How long a released session keeps refusing stores if the host never comes back to it.
const RELEASED_MEMORY: Duration = Duration::from_secs(600);

struct Entry<T> {
    session_id: String,
    value: T,
    created: Instant,
    last_access: Instant,
}

#[derive(Default)]
struct SessionRefs {
    ids: HashSet<String>,
    limits: Option<SessionLimits>,
}

/// Per-session table of live foreign objects.
pub struct Registry<T> {
    entries: DashMap<String, Entry<T>>,
    sessions: DashMap<String, SessionRefs>,
    /// released session -> when
    released: DashMap<String, Instant>,
    defaults: SessionLimits,
}

impl<T: Clone> Registry<T> {
    pub fn new(defaults: SessionLimits) -> Self {
        Self {
            entries: DashMap::new(),
            sessions: DashMap::new(),
            released: DashMap::new(),
            defaults,
        }
    }

    /// Sets the limits for one session. Existing entries are checked against
    /// them on the next store or prune.
    pub fn configure_session(&self, session_id: &str, limits: SessionLimits) {
        self.released.remove(session_id);
        self.sessions.entry(session_id.to_string()).or_default().limits = Some(limits);
    }

    fn limits(&self, session_id: &str) -> SessionLimits {
        self.sessions
            .get(session_id)
            .and_then(|s| s.limits)
            .unwrap_or(self.defaults)
    }

    /// Stores an object under a fresh ref id. Fails once the session has been
    /// released.
    pub fn store(&self, session_id: &str, value: T) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();

        self.entries.insert(id.clone(), Entry {
            session_id: session_id.to_string(),
            value,
            created: now,
            last_access: now,
        });

        // a release marks the session before sweeping it, so checking under the
        // session's lock either refuses this entry or leaves it for the sweep
        let count = {
            let mut session = self.sessions.entry(session_id.to_string()).or_default();
            if self.released.contains_key(session_id) {
                None
            } else {
                session.ids.insert(id.clone());
                Some(session.ids.len())
            }
        };
        let Some(count) = count else {
            self.entries.remove(&id);
            self.sessions.remove_if(session_id, |_, s| s.ids.is_empty() && s.limits.is_none());
            return Err(Error::SessionReleased(session_id.to_string()));
        };

        let max_refs = self.limits(session_id).max_refs;
        if max_refs > 0 && count > max_refs {
            self.evict(session_id, count - max_refs, &id);
        }

        Ok(id)
    }

    /// Drops the `n` least recently accessed entries of a session, never `keep`.
    fn evict(&self, session_id: &str, n: usize, keep: &str) {
        let ids: Vec<String> = match self.sessions.get(session_id) {
            Some(session) => session.ids.iter().filter(|id| id.as_str() != keep).cloned().collect(),
            None => return,
        };

        let mut by_age: Vec<(Instant, String)> = ids
            .into_iter()
            .filter_map(|id| self.entries.get(&id).map(|e| (e.last_access, id)))
            .collect();
        by_age.sort();

        for (_, id) in by_age.into_iter().take(n) {
            self.remove(&id);
            debug!(session_id, ref_id = %id, "evicted least recently used ref");
        }
    }

    /// Returns the object behind a ref, refreshing its access time.
    pub fn resolve(&self, session_id: &str, ref_id: &str) -> Result<T> {
        let ttl = self.ttl(session_id);

        let expired = {
            let mut entry = self
                .entries
                .get_mut(ref_id)
                .ok_or_else(|| Error::NotFound(ref_id.to_string()))?;

            if entry.session_id != session_id {
                return Err(Error::SessionMismatch {
                    ref_id: ref_id.to_string(),
                    session_id: session_id.to_string(),
                });
            }

            if ttl.is_some_and(|ttl| entry.created.elapsed() > ttl) {
                true
            } else {
                entry.last_access = Instant::now();
                return Ok(entry.value.clone());
            }
        };

        if expired {
            self.remove(ref_id);
        }
        Err(Error::NotFound(ref_id.to_string()))
    }

    fn ttl(&self, session_id: &str) -> Option<Duration> {
        match self.limits(session_id).ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Releases one ref. Returns whether it existed under this session.
    pub fn release(&self, session_id: &str, ref_id: &str) -> bool {
        let owned = self
            .entries
            .get(ref_id)
            .is_some_and(|e| e.session_id == session_id);
        if owned {
            self.remove(ref_id);
        }
        owned
    }

    /// Drops every ref of a session and refuses new ones. Returns how many
    /// were dropped.
    pub fn release_session(&self, session_id: &str) -> usize {
        self.released.insert(session_id.to_string(), Instant::now());
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return 0;
        };
        session
            .ids
            .iter()
            .filter(|id| self.entries.remove(id.as_str()).is_some())
            .count()
    }

    /// Drops every expired ref. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                self.ttl(&e.session_id)
                    .is_some_and(|ttl| e.created.elapsed() > ttl)
            })
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.remove(id);
        }
        self.released.retain(|_, at| at.elapsed() < RELEASED_MEMORY);
        expired.len()
    }

    pub fn is_released(&self, session_id: &str) -> bool {
        self.released.contains_key(session_id)
    }

    fn remove(&self, ref_id: &str) {
        if let Some((_, entry)) = self.entries.remove(ref_id) {
            if let Some(mut session) = self.sessions.get_mut(&entry.session_id) {
                session.ids.remove(ref_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn session_len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |s| s.ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(ttl_secs: u64, max_refs: usize) -> SessionLimits {
        SessionLimits { ttl_secs, max_refs }
    }

    #[test]
    fn test_store_and_resolve() {
        let registry = Registry::new(limits(0, 0));
        let id = registry.store("s1", "tensor").unwrap();
        assert_eq!(registry.resolve("s1", &id), Ok("tensor"));
        assert_eq!(registry.session_len("s1"), 1);
    }

    #[test]
    fn test_wrong_session_is_a_mismatch() {
        let registry = Registry::new(limits(0, 0));
        let id = registry.store("s1", 1).unwrap();
        assert!(matches!(registry.resolve("s2", &id), Err(Error::SessionMismatch { .. })));
        assert!(matches!(registry.resolve("s1", "nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_ids_are_unique_across_sessions() {
        let registry = Registry::new(limits(0, 0));
        let a = registry.store("s1", "Counter()").unwrap();
        let b = registry.store("s2", "Counter()").unwrap();
        assert_ne!(a, b);
        assert!(!registry.release("s1", &b));
        assert!(registry.release("s2", &b));
        assert_eq!(registry.resolve("s1", &a), Ok("Counter()"));
    }

    #[test]
    fn test_lru_eviction() {
        let registry = Registry::new(limits(0, 2));
        let first = registry.store("s1", 1).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = registry.store("s1", 2).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        // touch the older one so the newer becomes least recently used
        registry.resolve("s1", &first).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let third = registry.store("s1", 3).unwrap();
        assert_eq!(registry.session_len("s1"), 2);
        assert!(registry.resolve("s1", &first).is_ok());
        assert!(matches!(registry.resolve("s1", &second), Err(Error::NotFound(_))));
        assert!(registry.resolve("s1", &third).is_ok());
    }

    #[test]
    fn test_ttl_expiry_and_prune() {
        let registry = Registry::new(limits(0, 0));
        registry.configure_session("short", limits(1, 0));
        let gone = registry.store("short", 1).unwrap();
        let kept = registry.store("long", 2).unwrap();

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(registry.prune(), 1);
        assert!(matches!(registry.resolve("short", &gone), Err(Error::NotFound(_))));
        assert_eq!(registry.resolve("long", &kept), Ok(2));
    }

    #[test]
    fn test_release_session() {
        let registry = Registry::new(limits(0, 0));
        registry.store("s1", 1).unwrap();
        registry.store("s1", 2).unwrap();
        let other = registry.store("s2", 3).unwrap();

        assert_eq!(registry.release_session("s1"), 2);
        assert_eq!(registry.release_session("s1"), 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("s2", &other), Ok(3));
    }

    #[test]
    fn test_released_session_refuses_late_stores() {
        let registry = Registry::new(limits(0, 0));
        registry.store("job", 1).unwrap();
        assert_eq!(registry.release_session("job"), 1);
        assert!(registry.is_released("job"));

        // a call that was already running when the release arrived
        assert_eq!(registry.store("job", 2), Err(Error::SessionReleased("job".into())));
        assert_eq!(registry.session_len("job"), 0);
        assert!(registry.is_empty());

        // other sessions are unaffected
        assert!(registry.store("other", 3).is_ok());

        // the host coming back to the id opens it again
        registry.configure_session("job", limits(0, 0));
        assert!(!registry.is_released("job"));
        assert!(registry.store("job", 4).is_ok());
    }
}
