//! # Affinity Router
//!
//! Picks the worker that serves a call.
//!
//! ## Modes
//! - **hint**: try the preferred worker; if it is busy, missing or tainted, any
//!   free worker will do. A fallback does not move the preference.
//! - **strict_queue**: wait for the preferred worker.
//! - **strict_fail_fast**: take the preferred worker now or fail with `WorkerBusy`.
//!
//! Strict modes never fail over: a missing or tainted preferred worker is
//! `PreferredWorkerUnavailable`. Without a preferred worker every mode behaves
//! like `hint`.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::pool::Checkout;
use crate::pool::Pool;
use crate::pool::WorkerId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    #[default]
    Hint,
    StrictQueue,
    StrictFailFast,
}

impl Affinity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hint" => Some(Self::Hint),
            "strict_queue" => Some(Self::StrictQueue),
            "strict_fail_fast" => Some(Self::StrictFailFast),
            _ => None,
        }
    }

    pub fn is_strict(&self) -> bool {
        !matches!(self, Self::Hint)
    }
}

/// Checks out a worker, waiting when the mode allows it.
pub async fn checkout(pool: &Pool, preferred: Option<WorkerId>, mode: Affinity) -> Result<Checkout> {
    if let Some(id) = preferred {
        match pool.get(id).filter(|w| !w.is_tainted()) {
            None if mode.is_strict() => return Err(Error::PreferredWorkerUnavailable(id)),
            None => debug!(pool = pool.name(), worker = %id, "preferred worker unavailable, falling back"),
            Some(worker) => match mode {
                Affinity::StrictFailFast => {
                    let slot = worker.try_acquire().ok_or(Error::WorkerBusy(id))?;
                    return Ok(Checkout::new(worker, slot, pool.freed().clone()));
                }
                Affinity::StrictQueue => {
                    let slot = worker.acquire().await;
                    // the worker may have been tainted or removed while we queued
                    if worker.is_tainted() || pool.get(id).is_none() {
                        return Err(Error::PreferredWorkerUnavailable(id));
                    }
                    return Ok(Checkout::new(worker, slot, pool.freed().clone()));
                }
                Affinity::Hint => {
                    if let Some(slot) = worker.try_acquire() {
                        return Ok(Checkout::new(worker, slot, pool.freed().clone()));
                    }
                    debug!(pool = pool.name(), worker = %id, "preferred worker busy, falling back");
                }
            },
        }
    }

    checkout_any(pool).await
}

/// Checks out a worker without ever waiting. Used for stream pulls.
///
/// A `pinned` preferred worker is the only one that holds what the call needs,
/// so under `hint` a busy pinned worker is `NoWorkerAvailable` instead of a
/// fallback to a worker that would answer `RefNotFound`.
pub fn try_checkout(pool: &Pool, preferred: Option<WorkerId>, mode: Affinity, pinned: bool) -> Result<Checkout> {
    if let Some(id) = preferred {
        match pool.get(id).filter(|w| !w.is_tainted()) {
            None if mode.is_strict() => return Err(Error::PreferredWorkerUnavailable(id)),
            None => {}
            Some(worker) => match worker.try_acquire() {
                Some(slot) => return Ok(Checkout::new(worker, slot, pool.freed().clone())),
                None if mode.is_strict() => return Err(Error::WorkerBusy(id)),
                None if pinned => return Err(no_worker(pool)),
                None => {}
            },
        }
    }

    try_any(pool)?.ok_or_else(|| no_worker(pool))
}

fn no_worker(pool: &Pool) -> Error {
    Error::NoWorkerAvailable {
        pool: pool.name().to_string(),
    }
}

async fn checkout_any(pool: &Pool) -> Result<Checkout> {
    loop {
        // register interest before scanning so a release between the scan and
        // the await still wakes us
        let notified = pool.freed().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(checkout) = try_any(pool)? {
            return Ok(checkout);
        }

        notified.await;
    }
}

fn try_any(pool: &Pool) -> Result<Option<Checkout>> {
    let workers = pool.healthy();
    if workers.is_empty() {
        return Err(no_worker(pool));
    }

    for worker in workers {
        if let Some(slot) = worker.try_acquire() {
            return Ok(Some(Checkout::new(worker, slot, pool.freed().clone())));
        }
    }
    Ok(None)
}
