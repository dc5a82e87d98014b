//! Cache-aside access to upstream entities.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::key::{CacheKey, EntityKind};
use super::store::{KeyValueStore, StoreError};
use crate::executor::BackgroundExecutor;

/// Time to live per entity kind. A zero duration stores without expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub profile: Duration,
    pub name: Duration,
    pub history: Duration,
}

impl CacheTtls {
    pub fn for_kind(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Profile => self.profile,
            EntityKind::Name => self.name,
            EntityKind::NameHistory => self.history,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            profile: Duration::from_secs(86_400),
            name: Duration::from_secs(3_024_000),
            history: Duration::from_secs(86_400),
        }
    }
}

/// Typed cache over a shared [`KeyValueStore`].
///
/// Reads never fail: store errors and undecodable payloads count as a miss.
/// Writes are set-if-absent, run in the background, and only apply a TTL
/// when they performed the first write of a key.
#[derive(Clone)]
pub struct EntityCache {
    store: Arc<dyn KeyValueStore>,
    ttls: CacheTtls,
    executor: BackgroundExecutor,
}

impl EntityCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttls: CacheTtls, executor: BackgroundExecutor) -> Self {
        Self {
            store,
            ttls,
            executor,
        }
    }

    /// Look up a cached entity.
    pub async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get(&key.to_string()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                trace!(key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(value) => {
                trace!(key = %key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    /// Cache an entity in the background. The caller never observes the outcome.
    pub fn write<T: Serialize>(&self, key: CacheKey, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not encode entity for caching");
                return;
            }
        };

        let cache = self.clone();
        self.executor
            .submit("cache_write", async move { cache.store_if_absent(&key, payload).await.map(|_| ()) });
    }

    /// Store `payload` under `key` unless a value is already present.
    ///
    /// Returns `true` when this call performed the write.
    pub async fn store_if_absent(&self, key: &CacheKey, payload: Vec<u8>) -> Result<bool, StoreError> {
        let raw_key = key.to_string();

        if !self.store.set_if_absent(&raw_key, payload).await? {
            trace!(key = %key, "Entry already cached, keeping existing value");
            return Ok(false);
        }

        let ttl = self.ttls.for_kind(key.kind());
        if !ttl.is_zero() {
            self.store.expire(&raw_key, ttl).await?;
        }

        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached entity");
        Ok(true)
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// The executor running write-backs.
    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::upstream::NameRecord;
    use async_trait::async_trait;

    fn record(id: &str, name: &str) -> NameRecord {
        NameRecord {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn cache_with(store: Arc<MemoryStore>) -> EntityCache {
        EntityCache::new(store, CacheTtls::default(), BackgroundExecutor::new(8))
    }

    /// Store whose every command fails.
    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
        async fn set_if_absent(&self, _key: &str, _value: Vec<u8>) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
        async fn incr(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let key = CacheKey::name("Notch");

        cache.write(key.clone(), &record("069a79f444e94726a5befca90e38aaf5", "Notch"));
        cache.executor().drain().await;

        let cached: Option<NameRecord> = cache.read(&CacheKey::name("NOTCH")).await;
        assert_eq!(cached, Some(record("069a79f444e94726a5befca90e38aaf5", "Notch")));
        assert_eq!(store.ttl("name:notch").map(|t| t.as_secs() > 0), Some(true));
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_first_committed() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let key = CacheKey::name("notch");

        let first = serde_json::to_vec(&record("a", "notch")).unwrap();
        let second = serde_json::to_vec(&record("b", "notch")).unwrap();

        let (a, b) = tokio::join!(
            cache.store_if_absent(&key, first),
            cache.store_if_absent(&key, second),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a ^ b, "exactly one write must commit");

        let stored: NameRecord = cache.read(&key).await.unwrap();
        let expected = if a { "a" } else { "b" };
        assert_eq!(stored.id, expected);

        // A later write never overwrites the committed value
        let third = serde_json::to_vec(&record("c", "notch")).unwrap();
        assert!(!cache.store_if_absent(&key, third).await.unwrap());
        let stored: NameRecord = cache.read(&key).await.unwrap();
        assert_eq!(stored.id, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_does_not_refresh_ttl() {
        let store = Arc::new(MemoryStore::new());
        let ttls = CacheTtls {
            name: Duration::from_secs(60),
            ..CacheTtls::default()
        };
        let cache = EntityCache::new(store.clone(), ttls, BackgroundExecutor::new(8));
        let key = CacheKey::name("notch");

        let payload = serde_json::to_vec(&record("a", "notch")).unwrap();
        cache.store_if_absent(&key, payload).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(cache.read::<NameRecord>(&key).await.is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.read::<NameRecord>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_stores_without_expiry() {
        let store = Arc::new(MemoryStore::new());
        let ttls = CacheTtls {
            profile: Duration::ZERO,
            ..CacheTtls::default()
        };
        let cache = EntityCache::new(store.clone(), ttls, BackgroundExecutor::new(8));
        let key = CacheKey::Profile("00000000000000000000000000000000".into());

        assert!(cache.store_if_absent(&key, b"{}".to_vec()).await.unwrap());
        assert_eq!(store.ttl(&key.to_string()), None);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store.set_if_absent("name:notch", b"garbage".to_vec()).await.unwrap();
        let cache = cache_with(store);

        assert!(cache.read::<NameRecord>(&CacheKey::name("notch")).await.is_none());
    }

    #[tokio::test]
    async fn test_store_failures_are_absorbed() {
        let cache = EntityCache::new(
            Arc::new(BrokenStore),
            CacheTtls::default(),
            BackgroundExecutor::new(8),
        );
        let key = CacheKey::name("notch");

        assert!(cache.read::<NameRecord>(&key).await.is_none());
        cache.write(key, &record("a", "notch"));
        cache.executor().drain().await;
    }
}
