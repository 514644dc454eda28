use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Occupancy of one bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkheadStatus {
    pub name: String,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub queued: usize,
}

/// Concurrency cap for one dependency. Waiters are served FIFO by the
/// underlying semaphore.
pub(super) struct Bulkhead {
    name: String,
    max_concurrency: usize,
    max_queue: Option<usize>,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Decrements the queue counter even if the waiting caller is cancelled.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Bulkhead {
    pub(super) fn new(name: &str, max_concurrency: usize, max_queue: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            max_concurrency,
            max_queue,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            queued: AtomicUsize::new(0),
        }
    }

    pub(super) async fn enter(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        let _slot = QueueSlot(&self.queued);
        if let Some(max) = self.max_queue {
            if queued >= max {
                tracing::warn!(
                    service = %self.name,
                    max_concurrency = self.max_concurrency,
                    queued,
                    "Bulkhead full, rejecting call"
                );
                return Err(self.full(queued));
            }
        }

        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| self.full(queued))
    }

    fn full(&self, queued: usize) -> Error {
        Error::BulkheadFull {
            service: self.name.clone(),
            max_concurrency: self.max_concurrency,
            queued,
        }
    }

    pub(super) fn status(&self) -> BulkheadStatus {
        BulkheadStatus {
            name: self.name.clone(),
            max_concurrency: self.max_concurrency,
            in_flight: self.max_concurrency - self.permits.available_permits(),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}
