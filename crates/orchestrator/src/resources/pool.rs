use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{OrchestratorError, Result};

/// Fixed number of slots handed out in request order.
///
/// Tokio's semaphore is fair, so waiters are admitted FIFO. Closing the pool
/// wakes every waiter with [`OrchestratorError::ShuttingDown`].
#[derive(Clone)]
pub struct BoundedPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::ShuttingDown)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}
