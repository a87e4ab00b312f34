//! Mutual exclusion between the auto-recheck scheduler and the bulk
//! verification queue.
//!
//! Both drive fetch batches against the directory site; only one of them may
//! run a batch at a time. The bulk worker holds the guard for the span of
//! each job; the scheduler try-acquires once per cycle and defers the whole
//! cycle when it loses.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, TryLockError};

/// Shared try-acquire guard serializing scheduler cycles and bulk jobs.
#[derive(Clone)]
pub struct RecheckCoordinator {
    lock: Arc<Mutex<()>>,
}

/// Held for the span of one scheduler cycle or one bulk job.
pub struct CoordinatorGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RecheckCoordinator {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Non-blocking acquire for the scheduler: a lost race means a bulk job
    /// is active and the cycle defers.
    pub fn try_acquire(&self) -> Option<CoordinatorGuard> {
        match self.lock.clone().try_lock_owned() {
            Ok(guard) => Some(CoordinatorGuard { _guard: guard }),
            Err(TryLockError) => None,
        }
    }

    /// Blocking acquire for the bulk worker: waits out any in-flight
    /// scheduler cycle.
    pub async fn acquire(&self) -> CoordinatorGuard {
        CoordinatorGuard {
            _guard: self.lock.clone().lock_owned().await,
        }
    }
}

impl Default for RecheckCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
