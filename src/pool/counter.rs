//! Per-address request counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::KeyValueStore;
use crate::executor::BackgroundExecutor;

/// Expiry applied to a durable counter on every mirrored increment, so that
/// counters abandoned by a stopped process clean themselves up.
pub const DURABLE_COUNTER_TTL: Duration = Duration::from_secs(600);

/// Where and how counters are mirrored to the shared store.
#[derive(Clone)]
pub struct CounterMirror {
    store: Arc<dyn KeyValueStore>,
    executor: BackgroundExecutor,
}

impl CounterMirror {
    pub fn new(store: Arc<dyn KeyValueStore>, executor: BackgroundExecutor) -> Self {
        Self { store, executor }
    }
}

/// A request counter bound to one egress address.
///
/// Admission decisions only ever look at the local atomic value. The durable
/// copy in the shared store is updated in the background and exists for
/// observability across processes and restarts.
pub struct RateCounter {
    /// Store key of the durable copy
    key: String,
    /// Requests dispatched since the last reset
    count: AtomicU64,
    mirror: Option<CounterMirror>,
}

impl RateCounter {
    /// Create a purely local counter starting at zero.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            count: AtomicU64::new(0),
            mirror: None,
        }
    }

    /// Create a mirrored counter, seeding the local value from the durable copy.
    ///
    /// A failed or unparsable read starts the counter at zero.
    pub async fn restore(key: impl Into<String>, mirror: CounterMirror) -> Self {
        let key = key.into();

        let initial = match mirror.store.get(&key).await {
            Ok(Some(raw)) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or_else(|| {
                    warn!(key = %key, "Ignoring unparsable durable counter");
                    0
                }),
            Ok(None) => 0,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not restore durable counter");
                0
            }
        };

        debug!(key = %key, count = initial, "Restored rate counter");

        Self {
            key,
            count: AtomicU64::new(initial),
            mirror: Some(mirror),
        }
    }

    /// Record one dispatched request and return the new local count.
    pub fn increment(&self) -> u64 {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(mirror) = &self.mirror {
            let store = mirror.store.clone();
            let key = self.key.clone();
            mirror.executor.submit("counter_increment", async move {
                store.incr(&key).await?;
                store.expire(&key, DURABLE_COUNTER_TTL).await?;
                Ok::<(), crate::cache::StoreError>(())
            });
        }

        count
    }

    /// The local count. Never consults the shared store.
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Zero the local count and drop the durable copy.
    ///
    /// Mirror updates are unordered background tasks: an increment submitted
    /// just before the reset may land after the delete and leave a stale
    /// durable count, which [`restore`](Self::restore) would pick up on the
    /// next start. The copy expires after [`DURABLE_COUNTER_TTL`] and never
    /// affects admission within a running process.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);

        if let Some(mirror) = &self.mirror {
            let store = mirror.store.clone();
            let key = self.key.clone();
            mirror
                .executor
                .submit("counter_reset", async move { store.delete(&key).await });
        }
    }

    /// Store key of the durable copy.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }
}

impl std::fmt::Debug for RateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateCounter")
            .field("key", &self.key)
            .field("count", &self.get())
            .field("mirrored", &self.is_mirrored())
            .finish()
    }
}
