//! Public lookup entry points: cache first, then the upstream through the
//! address pool, writing successful results back to the cache.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, instrument};

use crate::cache::{CacheKey, EntityCache, KeyValueStore, MemoryStore};
use crate::config::{ProxyConfig, StoreConfig};
use crate::error::{ProxyError, Result};
use crate::executor::BackgroundExecutor;
use crate::pool::{expand_address_pool, CounterMirror};
use crate::upstream::{
    Fetcher, Identifier, NameChange, NameRecord, PooledFetcher, Profile, MAX_BATCH_NAMES,
};

/// Composes the entity cache and a fetcher into the lookups served to callers.
#[derive(Clone)]
pub struct Dispatcher {
    cache: EntityCache,
    fetcher: Arc<dyn Fetcher>,
}

impl Dispatcher {
    pub fn new(cache: EntityCache, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { cache, fetcher }
    }

    /// Wire up the store, cache, address pool and pooled fetcher from configuration.
    pub async fn from_config(config: &ProxyConfig, addresses: &BTreeMap<String, u64>) -> Result<Self> {
        let specs = expand_address_pool(addresses)?;
        if specs.is_empty() {
            return Err(ProxyError::Config("address pool is empty".to_string()));
        }

        let store = connect_store(&config.store).await?;
        let executor = BackgroundExecutor::new(config.cache.background_tasks);
        let cache = EntityCache::new(store.clone(), config.cache.ttls(), executor.clone());

        let fetcher = PooledFetcher::build(
            &specs,
            &config.upstream.settings()?,
            config.pool.options(),
            Some(CounterMirror::new(store, executor)),
            config.pool.rate_limit_retries,
        )
        .await?;

        Ok(Self::new(cache, Arc::new(fetcher)))
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Look up a profile by identifier, or by name as of `at` when the input
    /// is not an identifier.
    #[instrument(skip(self))]
    pub async fn lookup_profile(&self, id_or_name: &str, at: Option<DateTime<Utc>>) -> Result<Profile> {
        let id = match Identifier::parse(id_or_name) {
            Some(id) => id,
            None => self.resolve(id_or_name, at).await?,
        };

        let key = CacheKey::profile(&id);
        if let Some(profile) = self.cache.read(&key).await {
            return Ok(profile);
        }

        match self.fetcher.find_profile(&id).await? {
            Some(profile) => {
                self.cache.write(key, &profile);
                Ok(profile)
            }
            None => Err(ProxyError::NotFound(id.to_string())),
        }
    }

    /// Resolve a name to its identifier, either currently or as of `at`.
    #[instrument(skip(self))]
    pub async fn lookup_identifier(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<NameRecord> {
        let name = normalize_name(name)?;
        let key = CacheKey::name_at(&name, at);

        if let Some(record) = self.cache.read(&key).await {
            return Ok(record);
        }

        match self.fetcher.find_identifier(&name, at).await? {
            Some(record) => {
                self.cache.write(key, &record);
                Ok(record)
            }
            None => Err(ProxyError::NotFound(name)),
        }
    }

    /// Resolve up to 100 names at once.
    ///
    /// Cached names are answered from the cache; the rest go upstream in a
    /// single batch. Unknown names are left out of the result.
    #[instrument(skip(self, names), fields(count = names.len()))]
    pub async fn lookup_identifiers(&self, names: &[String]) -> Result<Vec<NameRecord>> {
        if names.len() > MAX_BATCH_NAMES {
            return Err(ProxyError::InvalidRequest(format!(
                "cannot look up more than {MAX_BATCH_NAMES} names at once"
            )));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(names.len());
        for name in names {
            let name = normalize_name(name)?;
            if seen.insert(name.clone()) {
                normalized.push(name);
            }
        }

        let lookups = normalized.iter().map(|name| async move {
            let cached: Option<NameRecord> = self.cache.read(&CacheKey::name(name)).await;
            (name, cached)
        });

        let mut records = Vec::with_capacity(normalized.len());
        let mut missing = Vec::new();
        for (name, cached) in join_all(lookups).await {
            match cached {
                Some(record) => records.push(record),
                None => missing.push(name.clone()),
            }
        }

        debug!(
            cached = records.len(),
            missing = missing.len(),
            "Resolved batch from cache"
        );

        if !missing.is_empty() {
            let fetched = self.fetcher.find_identifiers(&missing).await?;
            for record in &fetched {
                self.cache.write(CacheKey::name(&record.name), record);
            }
            records.extend(fetched);
        }

        Ok(records)
    }

    /// Look up every name a profile has had, by identifier or current name.
    #[instrument(skip(self))]
    pub async fn lookup_name_history(&self, id_or_name: &str) -> Result<Vec<NameChange>> {
        let id = match Identifier::parse(id_or_name) {
            Some(id) => id,
            None => self.resolve(id_or_name, None).await?,
        };

        let key = CacheKey::name_history(&id);
        if let Some(history) = self.cache.read(&key).await {
            return Ok(history);
        }

        match self.fetcher.name_history(&id).await? {
            Some(history) => {
                self.cache.write(key, &history);
                Ok(history)
            }
            None => Err(ProxyError::NotFound(id.to_string())),
        }
    }

    async fn resolve(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<Identifier> {
        let record = self.lookup_identifier(name, at).await?;
        Identifier::parse(&record.id).ok_or_else(|| {
            ProxyError::InvalidResponse(format!(
                "upstream resolved {name} to malformed identifier {:?}",
                record.id
            ))
        })
    }
}

async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(crate::cache::RedisStore::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(ProxyError::Config(
            "store.redis_url is set but the redis feature is not enabled".to_string(),
        )),
        None => {
            let period = config.sweep_interval()?;
            info!(sweep_interval_secs = period.as_secs(), "Using in-process store");
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(period);
            Ok(store)
        }
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ProxyError::InvalidRequest("name must not be empty".to_string()));
    }
    Ok(name.to_lowercase())
}
