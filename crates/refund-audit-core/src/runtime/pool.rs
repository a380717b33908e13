use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// RAII guard for one worker slot; dropping it frees the slot.
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPermit").finish()
    }
}

/// Bounds how many task loops process rows at the same time.
///
/// Loops beyond the capacity wait in [`Self::acquire`] (FIFO) instead of
/// being rejected.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Wait for a free slot. `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<WorkerPermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| WorkerPermit { _permit: permit })
    }

    /// Stop handing out slots; waiting loops exit without processing.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
