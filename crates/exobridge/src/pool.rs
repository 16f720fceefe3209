//! # Worker Pool
//!
//! An arena of workers keyed by stable `WorkerId`s. Sessions remember workers by
//! id only, so removing a worker never leaves a dangling handle behind: the next
//! lookup simply misses.
//!
//! Each worker has one slot. A `Checkout` holds it and gives it back on drop,
//! including when the call holding it is cancelled by a timeout.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::peer::Peer;

/// Strong type for worker identifiers.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

pub struct Worker {
    id: WorkerId,
    pool: String,
    peer: Peer,
    slot: Arc<Mutex<()>>,
    tainted: AtomicBool,
}

impl Worker {
    pub fn new(id: WorkerId, pool: impl Into<String>, peer: Peer) -> Self {
        Self {
            id,
            pool: pool.into(),
            peer,
            slot: Arc::new(Mutex::new(())),
            tainted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Tainted by hand, or its connection is gone.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire) || self.peer.is_closed()
    }

    pub(crate) fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.slot.clone().try_lock_owned().ok()
    }

    pub(crate) async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.slot.clone().lock_owned().await
    }
}

/// Exclusive use of a worker for the duration of one call.
pub struct Checkout {
    worker: Arc<Worker>,
    slot: Option<OwnedMutexGuard<()>>,
    freed: Arc<Notify>,
}

impl Checkout {
    pub(crate) fn new(worker: Arc<Worker>, slot: OwnedMutexGuard<()>, freed: Arc<Notify>) -> Self {
        Self {
            worker,
            slot: Some(slot),
            freed,
        }
    }

    /// Uses a worker whose slot is already held further up the call chain.
    pub(crate) fn reentrant(worker: Arc<Worker>, freed: Arc<Notify>) -> Self {
        Self {
            worker,
            slot: None,
            freed,
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if self.slot.take().is_some() {
            self.freed.notify_waiters();
        }
    }
}

/// A named set of workers.
pub struct Pool {
    name: String,
    workers: DashMap<WorkerId, Arc<Worker>>,
    freed: Arc<Notify>,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: DashMap::new(),
            freed: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, worker: Worker) {
        info!(pool = %self.name, worker = %worker.id, "worker added");
        self.workers.insert(worker.id, Arc::new(worker));
        self.freed.notify_waiters();
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.get(&id).map(|w| w.value().clone())
    }

    pub fn remove(&self, id: WorkerId) -> Option<Arc<Worker>> {
        let removed = self.workers.remove(&id).map(|(_, w)| w);
        if removed.is_some() {
            info!(pool = %self.name, worker = %id, "worker removed");
            self.freed.notify_waiters();
        }
        removed
    }

    /// Marks a worker as unfit for new calls. In-flight calls finish normally.
    pub fn taint(&self, id: WorkerId) -> bool {
        let Some(worker) = self.get(id) else {
            return false;
        };
        worker.tainted.store(true, Ordering::Release);
        info!(pool = %self.name, worker = %id, "worker tainted");
        self.freed.notify_waiters();
        true
    }

    pub fn restore(&self, id: WorkerId) -> bool {
        let Some(worker) = self.get(id) else {
            return false;
        };
        worker.tainted.store(false, Ordering::Release);
        info!(pool = %self.name, worker = %id, "worker restored");
        self.freed.notify_waiters();
        true
    }

    /// Worker ids in ascending order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.iter().map(|w| *w.key()).collect();
        ids.sort();
        ids
    }

    /// Healthy workers in ascending id order.
    pub(crate) fn healthy(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .filter(|w| !w.is_tainted())
            .map(|w| w.value().clone())
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    pub(crate) fn freed(&self) -> &Arc<Notify> {
        &self.freed
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
