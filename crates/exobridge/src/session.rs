//! # Session Manager
//!
//! Host-side bookkeeping for sessions: who owns them, which worker they prefer,
//! which refs they hold and where those refs live.
//!
//! ## Lifecycle
//! `unborn -> active -> released`. A session becomes active on the first call
//! from a caller context that has none (implicit), or through
//! `Bridge::with_session` (explicit). Release takes three steps: the session is
//! marked released so no new call can enter it, the calls already inside are
//! allowed to finish, then the workers are told to drop its objects and the
//! entry is removed.
//!
//! Uses DashMap so unrelated sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tagpack::StreamKind;
use tagpack::Value;
use tokio::sync::Notify;
use tracing::info;

use crate::error::Error;
use crate::error::Result;
use crate::frame::SessionLimits;
use crate::pool::WorkerId;
use crate::router::Affinity;

/// Per-session settings chosen when a session is opened explicitly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionOptions {
    /// Lifetime of each ref. Unset means the bridge default.
    pub ttl: Option<Duration>,
    pub max_refs: Option<usize>,
    pub affinity: Option<Affinity>,
    pub pool_name: Option<String>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_refs(mut self, max_refs: usize) -> Self {
        self.max_refs = Some(max_refs);
        self
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn pool(mut self, pool_name: impl Into<String>) -> Self {
        self.pool_name = Some(pool_name.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    Object,
    Stream(StreamKind),
}

/// What the host knows about a live ref.
#[derive(Clone, Debug, PartialEq)]
pub struct RefMeta {
    pub worker: WorkerId,
    pub pool: String,
    pub kind: RefKind,
    pub created_at: SystemTime,
    pub exhausted: bool,
    /// Session-local tick of the last call that produced or targeted the ref.
    pub last_used: u64,
}

struct SessionState {
    owner: Option<String>,
    created_at: SystemTime,
    options: SessionOptions,
    last_worker: Option<WorkerId>,
    refs: HashMap<String, RefMeta>,
    workers: HashMap<WorkerId, String>,
    released: bool,
    in_flight: usize,
    drained: Arc<Notify>,
    ticks: u64,
}

impl SessionState {
    fn new(owner: Option<String>, options: SessionOptions) -> Self {
        Self {
            owner,
            created_at: SystemTime::now(),
            options,
            last_worker: None,
            refs: HashMap::new(),
            workers: HashMap::new(),
            released: false,
            in_flight: 0,
            drained: Arc::new(Notify::new()),
            ticks: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Forgets refs the worker has dropped by now: expired ones, then the
    /// least recently used beyond `max_refs`. Mirrors the worker registry.
    fn trim(&mut self, limits: SessionLimits) {
        if limits.ttl_secs > 0 {
            let ttl = Duration::from_secs(limits.ttl_secs);
            self.refs
                .retain(|_, meta| !meta.created_at.elapsed().is_ok_and(|age| age > ttl));
        }

        if limits.max_refs > 0 && self.refs.len() > limits.max_refs {
            let mut by_use: Vec<(u64, String)> = self
                .refs
                .iter()
                .map(|(id, meta)| (meta.last_used, id.clone()))
                .collect();
            by_use.sort();
            let excess = self.refs.len() - limits.max_refs;
            for (_, id) in by_use.into_iter().take(excess) {
                self.refs.remove(&id);
            }
        }
    }
}

/// A point-in-time view of a session, for diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: SystemTime,
    pub last_worker: Option<WorkerId>,
    pub ref_count: usize,
    pub workers: Vec<WorkerId>,
    pub options: SessionOptions,
    pub released: bool,
}

/// Everything the router needs to know about a session for one call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Route {
    pub preferred: Option<WorkerId>,
    /// The preferred worker holds the target ref.
    pub pinned: bool,
    pub pool_name: Option<String>,
    pub affinity: Option<Affinity>,
    pub limits: SessionLimits,
}

/// A call in progress in one session. A release waits for every one of these
/// to be dropped before it tells the workers.
pub struct InFlight<'a> {
    sessions: &'a SessionManager,
    session_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.sessions.sessions.get_mut(&self.session_id) {
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 {
                state.drained.notify_waiters();
            }
        }
    }
}

pub struct SessionManager {
    sessions: DashMap<String, SessionState>,
    /// caller context id -> implicit session id
    implicit: DashMap<String, String>,
    /// Limits for sessions whose options leave them unset.
    defaults: SessionLimits,
}

impl SessionManager {
    pub fn new(defaults: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            implicit: DashMap::new(),
            defaults,
        }
    }

    /// Opens an explicit session. Returns false if it was already active.
    pub fn open(&self, session_id: &str, options: SessionOptions) -> Result<bool> {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) if entry.get().released => Err(Error::SessionReleased(session_id.to_string())),
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(SessionState::new(None, options));
                info!(session_id, "session opened");
                Ok(true)
            }
        }
    }

    /// Returns the implicit session of a caller context, creating it on first
    /// use. The flag says whether it was just created.
    ///
    /// Creation happens under the context's entry, so concurrent first calls
    /// from clones of one context agree on a single session.
    pub fn implicit_for(&self, context_id: &str) -> (String, bool) {
        match self.implicit.entry(context_id.to_string()) {
            Entry::Occupied(entry) if self.sessions.contains_key(entry.get()) => (entry.get().clone(), false),
            entry => {
                let session_id = uuid::Uuid::new_v4().to_string();
                self.sessions.insert(
                    session_id.clone(),
                    SessionState::new(Some(context_id.to_string()), SessionOptions::default()),
                );
                entry.insert(session_id.clone());
                info!(session_id = %session_id, context_id, "implicit session created");
                (session_id, true)
            }
        }
    }

    /// Makes sure a session named by a call option exists. The flag says
    /// whether it was just created.
    pub fn ensure(&self, session_id: &str) -> Result<bool> {
        self.open(session_id, SessionOptions::default())
    }

    /// Fails unless the session exists and is not being released.
    pub fn check_active(&self, session_id: &str) -> Result<()> {
        match self.sessions.get(session_id) {
            Some(state) if !state.released => Ok(()),
            _ => Err(Error::SessionReleased(session_id.to_string())),
        }
    }

    /// Registers a call in an active session.
    pub fn enter(&self, session_id: &str) -> Result<InFlight<'_>> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .filter(|s| !s.released)
            .ok_or_else(|| Error::SessionReleased(session_id.to_string()))?;
        state.in_flight += 1;

        Ok(InFlight {
            sessions: self,
            session_id: session_id.to_string(),
        })
    }

    /// Calls currently inside the session.
    pub fn in_flight(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |s| s.in_flight)
    }

    /// Waits until no call is inside the session.
    pub async fn drained(&self, session_id: &str) {
        loop {
            let drained = match self.sessions.get(session_id) {
                Some(state) if state.in_flight > 0 => state.drained.clone(),
                _ => return,
            };

            // register before re-checking so the last guard's drop still wakes us
            let notified = drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight(session_id) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Routing facts for a call, optionally targeting one ref.
    ///
    /// A ref's own worker wins over the session's last worker.
    pub fn route(&self, session_id: &str, target: Option<&str>) -> Result<Route> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .filter(|s| !s.released)
            .ok_or_else(|| Error::SessionReleased(session_id.to_string()))?;

        let tick = state.tick();
        let ref_worker = match target {
            Some(id) => state.refs.get_mut(id).map(|meta| {
                meta.last_used = tick;
                meta.worker
            }),
            None => None,
        };

        Ok(Route {
            preferred: ref_worker.or(state.last_worker),
            pinned: ref_worker.is_some(),
            pool_name: state.options.pool_name.clone(),
            affinity: state.options.affinity,
            limits: self.limits(&state),
        })
    }

    fn limits(&self, state: &SessionState) -> SessionLimits {
        SessionLimits {
            ttl_secs: state.options.ttl.map_or(self.defaults.ttl_secs, |ttl| ttl.as_secs()),
            max_refs: state.options.max_refs.unwrap_or(self.defaults.max_refs),
        }
    }

    /// Records a successful call: the serving worker becomes the preferred one
    /// if there was none yet, and every ref in the result is remembered.
    pub fn record_success(&self, session_id: &str, pool: &str, worker: WorkerId, result: &Value) {
        let Some(mut state) = self.sessions.get_mut(session_id) else {
            return;
        };

        state.last_worker.get_or_insert(worker);
        state.workers.insert(worker, pool.to_string());

        let now = SystemTime::now();
        let mut found = Vec::new();
        result.visit(&mut |value| match value {
            Value::Ref(r) if r.session_id == session_id => {
                found.push((r.id.clone(), RefKind::Object, false));
            }
            Value::StreamRef(s) if s.session_id == session_id => {
                found.push((s.id.clone(), RefKind::Stream(s.stream_kind), s.exhausted));
            }
            _ => {}
        });

        for (id, kind, exhausted) in found {
            let tick = state.tick();
            state
                .refs
                .entry(id)
                .and_modify(|meta| meta.last_used = tick)
                .or_insert_with(|| RefMeta {
                    worker,
                    pool: pool.to_string(),
                    kind,
                    created_at: now,
                    exhausted,
                    last_used: tick,
                });
        }

        let limits = self.limits(&state);
        state.trim(limits);
    }

    /// Notes that a worker has touched the session without producing a result.
    pub fn record_worker(&self, session_id: &str, pool: &str, worker: WorkerId) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.workers.insert(worker, pool.to_string());
        }
    }

    pub fn ref_meta(&self, session_id: &str, ref_id: &str) -> Option<RefMeta> {
        self.sessions.get(session_id)?.refs.get(ref_id).cloned()
    }

    /// Marks a stream as exhausted. There is no way back.
    pub fn mark_exhausted(&self, session_id: &str, stream_id: &str) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            if let Some(meta) = state.refs.get_mut(stream_id) {
                meta.exhausted = true;
            }
        }
    }

    pub fn is_exhausted(&self, session_id: &str, stream_id: &str) -> bool {
        self.ref_meta(session_id, stream_id).is_some_and(|m| m.exhausted)
    }

    pub fn forget_ref(&self, session_id: &str, ref_id: &str) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.refs.remove(ref_id);
        }
    }

    /// Marks a session released. Returns false if the session is unknown or
    /// already being released.
    pub fn begin_release(&self, session_id: &str) -> bool {
        let Some(mut state) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if state.released {
            return false;
        }
        state.released = true;
        true
    }

    /// Every worker the session has been sent to, as `(pool, worker)`.
    pub fn release_targets(&self, session_id: &str) -> Vec<(String, WorkerId)> {
        let Some(state) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let mut workers: Vec<(String, WorkerId)> =
            state.workers.iter().map(|(id, pool)| (pool.clone(), *id)).collect();
        workers.sort_by_key(|(_, id)| *id);
        workers
    }

    /// Drops all local bookkeeping for a session.
    pub fn finish_release(&self, session_id: &str) {
        if let Some((_, state)) = self.sessions.remove(session_id) {
            if let Some(owner) = state.owner {
                self.implicit.remove_if(&owner, |_, v| v == session_id);
            }
        }
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let mut state = self.sessions.get_mut(session_id)?;
        let limits = self.limits(&state);
        state.trim(limits);
        let mut workers: Vec<WorkerId> = state.workers.keys().copied().collect();
        workers.sort();

        Some(SessionInfo {
            id: session_id.to_string(),
            created_at: state.created_at,
            last_worker: state.last_worker,
            ref_count: state.refs.len(),
            workers,
            options: state.options.clone(),
            released: state.released,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
