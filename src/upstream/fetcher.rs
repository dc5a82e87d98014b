//! The fetch capability shared by single-address and pooled clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info};

use super::client::{UpstreamClient, UpstreamSettings};
use super::model::{Identifier, NameChange, NameRecord, Profile};
use crate::error::{ProxyError, Result};
use crate::pool::{AddressSpec, CounterMirror, EgressIdentity, IdentityPool, Lease, PoolOptions};

/// Lookups against the upstream API.
///
/// `Ok(None)` means the upstream authoritatively has no such mapping.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Look up a full profile.
    async fn find_profile(&self, id: &Identifier) -> Result<Option<Profile>>;

    /// Resolve a name, either currently or as it was at `at`.
    async fn find_identifier(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<Option<NameRecord>>;

    /// Resolve up to 100 names in one call. Unknown names are left out.
    async fn find_identifiers(&self, names: &[String]) -> Result<Vec<NameRecord>>;

    /// Look up every name a profile has had.
    async fn name_history(&self, id: &Identifier) -> Result<Option<Vec<NameChange>>>;
}

/// Spreads calls over a pool of egress addresses.
///
/// Each call borrows one client for its whole duration. A call rejected with
/// a rate limit may be retried from a different address, up to
/// `rate_limit_retries` times.
pub struct PooledFetcher {
    pool: IdentityPool<UpstreamClient>,
    rate_limit_retries: u32,
}

impl PooledFetcher {
    pub fn new(pool: IdentityPool<UpstreamClient>, rate_limit_retries: u32) -> Self {
        Self {
            pool,
            rate_limit_retries,
        }
    }

    /// Build one client per egress address. Counters are restored from the
    /// shared store when a mirror is given.
    pub async fn build(
        addresses: &[AddressSpec],
        settings: &UpstreamSettings,
        options: PoolOptions,
        mirror: Option<CounterMirror>,
        rate_limit_retries: u32,
    ) -> Result<Self> {
        let mut clients = Vec::with_capacity(addresses.len());

        for spec in addresses {
            let identity = match &mirror {
                Some(mirror) => EgressIdentity::mirrored(spec.address, spec.rate_limit, mirror.clone()).await,
                None => EgressIdentity::new(spec.address, spec.rate_limit),
            };
            clients.push(UpstreamClient::new(identity, settings.clone())?);
        }

        info!(
            addresses = clients.len(),
            mirrored = mirror.is_some(),
            "Egress address pool initialized"
        );

        Ok(Self::new(IdentityPool::new(clients, options), rate_limit_retries))
    }

    pub fn pool(&self) -> &IdentityPool<UpstreamClient> {
        &self.pool
    }

    /// Run `call` on a borrowed client, moving to another address when it is
    /// rate limited and retries remain. The lease is held for the whole call.
    async fn with_lease<'a, T, F>(&'a self, call: F) -> Result<T>
    where
        F: Fn(&'a UpstreamClient) -> BoxFuture<'a, Result<T>> + Send,
        T: Send,
    {
        let mut lease = self.pool.borrow().await?;
        let mut retries_left = self.rate_limit_retries;
        loop {
            let result = call(lease.pooled()).await;
            if is_rate_limited(&result) {
                if let Some(next) = self.retry_lease(&lease, &mut retries_left) {
                    lease = next;
                    continue;
                }
            }
            return result;
        }
    }

    /// Reset the rate-limited identity and, if retries remain, lend a different one.
    fn retry_lease<'a>(
        &'a self,
        lease: &Lease<'a, UpstreamClient>,
        retries_left: &mut u32,
    ) -> Option<Lease<'a, UpstreamClient>> {
        lease.mark_rate_limited();

        if *retries_left == 0 {
            return None;
        }

        let next = self.pool.try_borrow()?;
        *retries_left -= 1;
        debug!(
            from = %lease.identity().address(),
            to = %next.identity().address(),
            "Retrying rate limited call from another address"
        );
        Some(next)
    }
}

fn is_rate_limited<T>(result: &Result<T>) -> bool {
    matches!(result, Err(ProxyError::RateLimited { .. }))
}

#[async_trait]
impl Fetcher for PooledFetcher {
    async fn find_profile(&self, id: &Identifier) -> Result<Option<Profile>> {
        self.with_lease(|client| client.find_profile(id)).await
    }

    async fn find_identifier(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<Option<NameRecord>> {
        self.with_lease(|client| client.find_identifier(name, at)).await
    }

    async fn find_identifiers(&self, names: &[String]) -> Result<Vec<NameRecord>> {
        self.with_lease(|client| client.find_identifiers(names)).await
    }

    async fn name_history(&self, id: &Identifier) -> Result<Option<Vec<NameChange>>> {
        self.with_lease(|client| client.name_history(id)).await
    }
}
