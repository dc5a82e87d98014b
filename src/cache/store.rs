//! The narrow key-value contract shared by the entity cache and the durable
//! rate counters, plus its realizations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Errors that can occur while talking to the shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),
    #[error("Store command failed: {0}")]
    Command(String),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
}

/// Key-value store with TTLs and atomic set-if-absent.
///
/// No multi-key transactional guarantee is assumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the raw value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` at `key` only if nothing is stored there yet.
    ///
    /// Returns `true` when this call performed the write.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Apply a time to live to an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Increment the integer at `key` by one, creating it at zero first.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store.
///
/// Expired keys are invisible as soon as they expire and are dropped either
/// when touched or by the next [`purge_expired`](Self::purge_expired) pass.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, including expired keys not yet touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Purge expired keys every `period` on the current runtime.
    ///
    /// The task holds only a weak reference and ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Store dropped, stopping expiry sweep");
                    break;
                };

                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired keys");
                }
            }
        })
    }

    /// Remaining time to live of `key`, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        Ok(None)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(false);
                }
                occupied.insert(StoredValue {
                    value,
                    expires_at: None,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value,
                    expires_at: None,
                });
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                value: b"0".to_vec(),
                expires_at: None,
            });

        if entry.is_expired(now) {
            *entry = StoredValue {
                value: b"0".to_vec(),
                expires_at: None,
            };
        }

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::NotAnInteger(key.to_string()))?;
        let next = current + 1;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::info;

    use super::{KeyValueStore, StoreError};

    /// Store backed by a shared Redis instance.
    #[derive(Clone)]
    pub struct RedisStore {
        connection: ConnectionManager,
    }

    impl RedisStore {
        /// Connect to the Redis server at `url`.
        pub async fn connect(url: &str) -> Result<Self, StoreError> {
            let client =
                redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
            let connection = ConnectionManager::new(client)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            info!("Connected to Redis store");
            Ok(Self { connection })
        }
    }

    fn command_error(e: redis::RedisError) -> StoreError {
        StoreError::Command(e.to_string())
    }

    #[async_trait]
    impl KeyValueStore for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            let mut conn = self.connection.clone();
            conn.get(key).await.map_err(command_error)
        }

        async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            conn.set_nx(key, value).await.map_err(command_error)
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            let mut conn = self.connection.clone();
            conn.expire(key, ttl.as_secs() as i64)
                .await
                .map_err(command_error)
        }

        async fn incr(&self, key: &str) -> Result<i64, StoreError> {
            let mut conn = self.connection.clone();
            conn.incr(key, 1).await.map_err(command_error)
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            let mut conn = self.connection.clone();
            conn.del(key).await.map_err(command_error)
        }
    }
}
