//! Bounded fire-and-forget executor for work that must never slow down the
//! request path: cache write-backs and durable counter mirroring.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Default number of background tasks allowed in flight at once.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Spawns detached tasks onto the current Tokio runtime.
///
/// At most `capacity` tasks run at once. A task submitted while the executor is
/// saturated is dropped with a warning instead of queueing, so a slow store can
/// never push backpressure into callers.
#[derive(Clone)]
pub struct BackgroundExecutor {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BackgroundExecutor {
    /// Create an executor allowing `capacity` concurrent tasks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Submit a task. Failures are logged under `label` and otherwise ignored.
    pub fn submit<F, E>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            warn!(task = label, "No runtime available, dropping background task");
            return;
        };

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    task = label,
                    capacity = self.capacity,
                    "Background executor saturated, dropping task"
                );
                return;
            }
        };

        handle.spawn(async move {
            match task.await {
                Ok(()) => trace!(task = label, "Background task completed"),
                Err(e) => warn!(task = label, error = %e, "Background task failed"),
            }
            drop(permit);
        });
    }

    /// Number of tasks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait until every task submitted so far has finished.
    pub async fn drain(&self) {
        if let Ok(all) = self.permits.acquire_many(self.capacity as u32).await {
            drop(all);
        }
    }
}

impl Default for BackgroundExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
