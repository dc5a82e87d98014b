//! Round-robin pool of egress identities.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::identity::EgressIdentity;
use crate::error::{ProxyError, Result};

/// Anything the pool can lend: it must expose the identity it is bound to.
pub trait Pooled: Send + Sync {
    fn identity(&self) -> &EgressIdentity;
}

impl Pooled for EgressIdentity {
    fn identity(&self) -> &EgressIdentity {
        self
    }
}

/// What happens to an identity found at its rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Reset the counter and lend the identity straight away.
    Immediate,
    /// Reset the counter and keep the identity out of rotation for a while.
    Cooldown(Duration),
}

/// Pool behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// How long `borrow` waits for a return when nothing is eligible.
    /// Zero rejects immediately.
    pub acquire_timeout: Duration,
    pub eviction: EvictionPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(250),
            eviction: EvictionPolicy::Immediate,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub lent: usize,
    pub evictions: u64,
}

struct Slot<C> {
    item: C,
    lent: AtomicBool,
    quarantined_until: Mutex<Option<Instant>>,
}

impl<C> Slot<C> {
    fn is_quarantined(&self, now: Instant) -> bool {
        let mut until = self.quarantined_until.lock();
        match *until {
            Some(deadline) if deadline > now => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }

    fn release(&self) {
        self.lent.store(false, Ordering::Release);
    }
}

/// Owns every egress identity and lends them out one call at a time.
///
/// Selection walks a shared cursor round-robin. The cursor, each slot's lent
/// flag and quarantine deadline, and each counter are the only shared mutable
/// state; there is no pool-wide lock.
pub struct IdentityPool<C> {
    slots: Vec<Slot<C>>,
    cursor: AtomicUsize,
    returned: Notify,
    evictions: AtomicU64,
    options: PoolOptions,
}

impl<C: Pooled> IdentityPool<C> {
    /// Create a pool. The cursor starts at a random slot so that replicas
    /// sharing an address list do not all start on the same address.
    pub fn new(items: Vec<C>, options: PoolOptions) -> Self {
        let start = if items.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..items.len())
        };

        let slots = items
            .into_iter()
            .map(|item| Slot {
                item,
                lent: AtomicBool::new(false),
                quarantined_until: Mutex::new(None),
            })
            .collect();

        Self {
            slots,
            cursor: AtomicUsize::new(start),
            returned: Notify::new(),
            evictions: AtomicU64::new(0),
            options,
        }
    }

    /// Lend the next eligible identity, waiting up to the acquire timeout
    /// when every identity is lent or quarantined.
    pub async fn borrow(&self) -> Result<Lease<'_, C>> {
        if let Some(lease) = self.try_borrow() {
            return Ok(lease);
        }

        if self.slots.is_empty() || self.options.acquire_timeout.is_zero() {
            warn!(size = self.slots.len(), "No egress address available");
            return Err(ProxyError::PoolExhausted);
        }

        let deadline = Instant::now() + self.options.acquire_timeout;
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_borrow() {
                return Ok(lease);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_borrow().ok_or_else(|| {
                    warn!(
                        size = self.slots.len(),
                        timeout_ms = self.options.acquire_timeout.as_millis() as u64,
                        "Timed out waiting for an egress address"
                    );
                    ProxyError::PoolExhausted
                });
            }
        }
    }

    /// Lend the next eligible identity without waiting.
    pub fn try_borrow(&self) -> Option<Lease<'_, C>> {
        let size = self.slots.len();
        let now = Instant::now();

        for _ in 0..size {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % size;
            let slot = &self.slots[index];

            if slot
                .lent
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if slot.is_quarantined(now) {
                slot.release();
                continue;
            }

            if slot.item.identity().is_exhausted() {
                self.evict(slot);
                if matches!(self.options.eviction, EvictionPolicy::Cooldown(_)) {
                    slot.release();
                    continue;
                }
            }

            trace!(address = %slot.item.identity().address(), "Lending egress address");
            return Some(Lease { pool: self, index });
        }

        None
    }

    fn evict(&self, slot: &Slot<C>) {
        let identity = slot.item.identity();
        debug!(
            address = %identity.address(),
            count = identity.counter().get(),
            limit = identity.rate_limit(),
            "Evicting exhausted egress address"
        );

        identity.counter().reset();
        self.evictions.fetch_add(1, Ordering::Relaxed);

        if let EvictionPolicy::Cooldown(cooldown) = self.options.eviction {
            *slot.quarantined_until.lock() = Some(Instant::now() + cooldown);
        }
    }

    fn give_back(&self, index: usize) {
        self.slots[index].release();
        self.returned.notify_one();
    }

    /// Iterate every pooled item, lent or not.
    pub fn items(&self) -> impl Iterator<Item = &C> {
        self.slots.iter().map(|slot| &slot.item)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.slots.len(),
            lent: self
                .slots
                .iter()
                .filter(|slot| slot.lent.load(Ordering::Acquire))
                .count(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A lent identity. Dropping the lease returns it to the pool, whatever the
/// outcome of the call it was used for.
pub struct Lease<'a, C: Pooled> {
    pool: &'a IdentityPool<C>,
    index: usize,
}

impl<'a, C: Pooled> Lease<'a, C> {
    pub fn identity(&self) -> &EgressIdentity {
        self.pool.slots[self.index].item.identity()
    }

    /// The lent item, borrowed for the pool's lifetime rather than the
    /// lease's, so it can be handed to a future awaited while the lease is held.
    pub fn pooled(&self) -> &'a C {
        &self.pool.slots[self.index].item
    }

    /// The upstream rejected this identity with a rate limit: reset it before
    /// it goes back into rotation.
    pub fn mark_rate_limited(&self) {
        let slot = &self.pool.slots[self.index];
        warn!(address = %slot.item.identity().address(), "Egress address rate limited upstream");
        self.pool.evict(slot);
    }
}

impl<C: Pooled> Deref for Lease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.pool.slots[self.index].item
    }
}

impl<C: Pooled> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        self.pool.give_back(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::IpAddr;

    fn identities(count: u8, rate_limit: u64) -> Vec<EgressIdentity> {
        (1..=count)
            .map(|i| EgressIdentity::new(IpAddr::from([10, 0, 0, i]), rate_limit))
            .collect()
    }

    fn reject_when_exhausted() -> PoolOptions {
        PoolOptions {
            acquire_timeout: Duration::ZERO,
            eviction: EvictionPolicy::Immediate,
        }
    }

    #[test]
    fn test_round_robin_visits_every_identity() {
        let pool = IdentityPool::new(identities(4, 100), reject_when_exhausted());

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let lease = pool.try_borrow().unwrap();
            seen.insert(lease.identity().address());
        }

        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_lent_identity_is_not_lent_twice() {
        let pool = IdentityPool::new(identities(2, 100), reject_when_exhausted());

        let a = pool.try_borrow().unwrap();
        let b = pool.try_borrow().unwrap();
        assert_ne!(a.identity().address(), b.identity().address());
        assert!(pool.try_borrow().is_none());
        assert_eq!(pool.stats().lent, 2);

        drop(a);
        assert!(pool.try_borrow().is_some());
    }

    #[test]
    fn test_return_keeps_counter() {
        let pool = IdentityPool::new(identities(1, 100), reject_when_exhausted());

        {
            let lease = pool.try_borrow().unwrap();
            lease.identity().counter().increment();
        }

        let lease = pool.try_borrow().unwrap();
        assert_eq!(lease.identity().counter().get(), 1);
    }

    #[test]
    fn test_never_lends_over_limit_identity() {
        let pool = IdentityPool::new(identities(5, 3), reject_when_exhausted());

        // Exhaust every identity but the last one
        for identity in pool.items().take(4) {
            for _ in 0..10 {
                identity.counter().increment();
            }
        }

        for _ in 0..50 {
            let lease = pool.try_borrow().unwrap();
            let identity = lease.identity();
            assert!(identity.counter().get() <= identity.rate_limit());
            identity.counter().increment();
        }

        assert!(pool.stats().evictions >= 4);
    }

    #[test]
    fn test_exhausted_identity_is_reset_and_readmitted() {
        let pool = IdentityPool::new(identities(1, 2), reject_when_exhausted());

        for expected in [1, 2] {
            let lease = pool.try_borrow().unwrap();
            assert_eq!(lease.identity().counter().increment(), expected);
        }

        let lease = pool.try_borrow().unwrap();
        assert_eq!(lease.identity().counter().get(), 0);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[test]
    fn test_mark_rate_limited_resets_counter() {
        let pool = IdentityPool::new(identities(1, 100), reject_when_exhausted());

        {
            let lease = pool.try_borrow().unwrap();
            lease.identity().counter().increment();
            lease.mark_rate_limited();
        }

        assert_eq!(pool.items().next().unwrap().counter().get(), 0);
        assert_eq!(pool.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_borrow_rejects_immediately_without_timeout() {
        let pool = IdentityPool::new(identities(1, 100), reject_when_exhausted());
        let _held = pool.borrow().await.unwrap();

        assert!(matches!(pool.borrow().await, Err(ProxyError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted() {
        let pool: IdentityPool<EgressIdentity> = IdentityPool::new(Vec::new(), PoolOptions::default());
        assert!(pool.is_empty());
        assert!(matches!(pool.borrow().await, Err(ProxyError::PoolExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_waits_for_return() {
        let pool = std::sync::Arc::new(IdentityPool::new(
            identities(1, 100),
            PoolOptions {
                acquire_timeout: Duration::from_secs(1),
                eviction: EvictionPolicy::Immediate,
            },
        ));

        let held = pool.try_borrow().unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|l| l.identity().address()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        let address = waiter.await.unwrap().unwrap();
        assert_eq!(address, IpAddr::from([10, 0, 0, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_borrow_times_out() {
        let pool = IdentityPool::new(
            identities(1, 100),
            PoolOptions {
                acquire_timeout: Duration::from_millis(50),
                eviction: EvictionPolicy::Immediate,
            },
        );

        let _held = pool.try_borrow().unwrap();
        assert!(matches!(pool.borrow().await, Err(ProxyError::PoolExhausted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrowers_never_share_an_identity() {
        use std::sync::Arc;

        const IDENTITIES: u8 = 4;
        const BORROWERS: usize = 32;
        const ROUNDS: usize = 200;

        let pool = Arc::new(IdentityPool::new(
            identities(IDENTITIES, 1_000_000),
            PoolOptions {
                acquire_timeout: Duration::from_secs(10),
                eviction: EvictionPolicy::Immediate,
            },
        ));
        let in_use: Arc<Vec<AtomicBool>> =
            Arc::new((0..IDENTITIES).map(|_| AtomicBool::new(false)).collect());

        let tasks: Vec<_> = (0..BORROWERS)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                tokio::spawn(async move {
                    for _ in 0..ROUNDS {
                        let lease = pool.borrow().await.unwrap();
                        let IpAddr::V4(address) = lease.identity().address() else {
                            unreachable!()
                        };
                        let slot = &in_use[usize::from(address.octets()[3] - 1)];

                        assert!(!slot.swap(true, Ordering::SeqCst), "identity lent twice");
                        lease.identity().counter().increment();
                        tokio::task::yield_now().await;
                        slot.store(false, Ordering::SeqCst);
                        drop(lease);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.lent, 0);
        assert_eq!(stats.evictions, 0);
        let total: u64 = pool.items().map(|identity| identity.counter().get()).sum();
        assert_eq!(total, (BORROWERS * ROUNDS) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_quarantines_exhausted_identity() {
        let pool = IdentityPool::new(
            identities(2, 1),
            PoolOptions {
                acquire_timeout: Duration::ZERO,
                eviction: EvictionPolicy::Cooldown(Duration::from_secs(30)),
            },
        );

        for identity in pool.items() {
            identity.counter().increment();
        }

        // Both are at their ceiling: each gets evicted and quarantined
        assert!(pool.try_borrow().is_none());
        assert_eq!(pool.stats().evictions, 2);

        tokio::time::advance(Duration::from_secs(31)).await;

        let lease = pool.try_borrow().unwrap();
        assert_eq!(lease.identity().counter().get(), 0);
    }
}
