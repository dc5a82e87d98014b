//! Configuration management for the proxy.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheTtls;
use crate::error::{ProxyError, Result};
use crate::pool::{EvictionPolicy, PoolOptions};
use crate::upstream::UpstreamSettings;

/// Prefix of environment variables overriding file configuration,
/// e.g. `MOJANG_PROXY__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "MOJANG_PROXY";

/// Main configuration for the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Entity cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Egress address pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Upstream API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the session server
    #[serde(default = "default_session_url")]
    pub session_url: String,

    /// Base URL of the account API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Whole-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            session_url: default_session_url(),
            api_url: default_api_url(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_session_url() -> String {
    "https://sessionserver.mojang.com".to_string()
}

fn default_api_url() -> String {
    "https://api.mojang.com".to_string()
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_connect_timeout() -> u64 {
    2000
}

impl UpstreamConfig {
    pub fn settings(&self) -> Result<UpstreamSettings> {
        if self.request_timeout_ms == 0 {
            return Err(ProxyError::Config(
                "upstream.request_timeout_ms must be positive".to_string(),
            ));
        }

        UpstreamSettings::new(
            &self.session_url,
            &self.api_url,
            Duration::from_millis(self.request_timeout_ms),
            Duration::from_millis(self.connect_timeout_ms),
        )
    }
}

/// Entity cache configuration. A TTL of zero caches without expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_profile_ttl")]
    pub profile_ttl_secs: u64,

    #[serde(default = "default_name_ttl")]
    pub name_ttl_secs: u64,

    #[serde(default = "default_history_ttl")]
    pub history_ttl_secs: u64,

    /// Maximum background cache writes and counter updates in flight
    #[serde(default = "default_background_tasks")]
    pub background_tasks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            profile_ttl_secs: default_profile_ttl(),
            name_ttl_secs: default_name_ttl(),
            history_ttl_secs: default_history_ttl(),
            background_tasks: default_background_tasks(),
        }
    }
}

fn default_profile_ttl() -> u64 {
    86_400
}

fn default_name_ttl() -> u64 {
    3_024_000
}

fn default_history_ttl() -> u64 {
    86_400
}

fn default_background_tasks() -> usize {
    crate::executor::DEFAULT_CAPACITY
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            profile: Duration::from_secs(self.profile_ttl_secs),
            name: Duration::from_secs(self.name_ttl_secs),
            history: Duration::from_secs(self.history_ttl_secs),
        }
    }
}

/// How exhausted egress addresses are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMode {
    /// Reset and re-admit straight away
    #[default]
    Immediate,
    /// Reset and keep out of rotation for `cooldown_secs`
    Cooldown,
}

/// Egress address pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// JSON file mapping address literals or ranges to rate ceilings
    #[serde(default = "default_addresses_file")]
    pub addresses_file: PathBuf,

    /// How long a lookup waits for a free address, in milliseconds.
    /// Zero rejects immediately.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    #[serde(default)]
    pub eviction: EvictionMode,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Times a rate limited call is retried from another address
    #[serde(default)]
    pub rate_limit_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            addresses_file: default_addresses_file(),
            acquire_timeout_ms: default_acquire_timeout(),
            eviction: EvictionMode::default(),
            cooldown_secs: default_cooldown(),
            rate_limit_retries: 0,
        }
    }
}

fn default_addresses_file() -> PathBuf {
    PathBuf::from("addresses.json")
}

fn default_acquire_timeout() -> u64 {
    250
}

fn default_cooldown() -> u64 {
    60
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        let eviction = match self.eviction {
            EvictionMode::Immediate => EvictionPolicy::Immediate,
            EvictionMode::Cooldown => EvictionPolicy::Cooldown(Duration::from_secs(self.cooldown_secs)),
        };

        PoolOptions {
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            eviction,
        }
    }

    /// Load the address-pool mapping from `addresses_file`.
    pub fn load_addresses(&self) -> Result<BTreeMap<String, u64>> {
        load_addresses(&self.addresses_file)
    }
}

/// Load an address-pool mapping (`{"10.0.0.1-10.0.0.8": 600}`) from a JSON file.
fn load_addresses(path: &Path) -> Result<BTreeMap<String, u64>> {
    info!(path = %path.display(), "Loading egress address pool");
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| {
        ProxyError::Config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; the in-process store is used when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How often the in-process store drops expired keys, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Result<Duration> {
        if self.sweep_interval_secs == 0 {
            return Err(ProxyError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.sweep_interval_secs))
    }
}

impl ProxyConfig {
    /// Load configuration from an optional file, overridden by environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProxyError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();

        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.upstream.api_url, "https://api.mojang.com");
        assert_eq!(config.cache.ttls(), CacheTtls::default());
        assert_eq!(config.pool.options(), PoolOptions::default());
        assert!(config.store.redis_url.is_none());
    }

    /// Write `contents` to a uniquely named temp file with the given extension.
    fn temp_file(name: &str, extension: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mojang-proxy-{name}-{}.{extension}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_from_yaml_file() {
        let path = temp_file(
            "config",
            "yaml",
            r#"
server:
  listen_addr: "0.0.0.0:9000"
cache:
  profile_ttl_secs: 0
pool:
  eviction: cooldown
  cooldown_secs: 30
  acquire_timeout_ms: 0
  rate_limit_retries: 2
store:
  sweep_interval_secs: 5
"#,
        );
        let config = ProxyConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        let config = config.unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.cache.ttls().profile, Duration::ZERO);
        assert_eq!(config.cache.name_ttl_secs, 3_024_000);
        assert_eq!(config.pool.rate_limit_retries, 2);
        assert_eq!(
            config.pool.options(),
            PoolOptions {
                acquire_timeout: Duration::ZERO,
                eviction: EvictionPolicy::Cooldown(Duration::from_secs(30)),
            }
        );
        assert_eq!(config.store.sweep_interval().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_yaml_file() {
        let path = temp_file("invalid", "yaml", "pool:\n  eviction: sometimes\n");
        let result = ProxyConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let store = StoreConfig {
            sweep_interval_secs: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(store.sweep_interval(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_upstream_settings() {
        let settings = UpstreamConfig::default().settings().unwrap();
        assert_eq!(settings.request_timeout, Duration::from_secs(5));

        let zero = UpstreamConfig {
            request_timeout_ms: 0,
            ..UpstreamConfig::default()
        };
        assert!(matches!(zero.settings(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_load_addresses() {
        let path = temp_file("addresses", "json", r#"{"127.0.0.1": 2, "10.0.0.1-10.0.0.4": 600}"#);
        let pool = PoolConfig {
            addresses_file: path.clone(),
            ..PoolConfig::default()
        };

        let addresses = pool.load_addresses().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses["127.0.0.1"], 2);
        assert_eq!(addresses["10.0.0.1-10.0.0.4"], 600);
    }

    #[test]
    fn test_load_addresses_missing_file() {
        let result = load_addresses(Path::new("/nonexistent/addresses.json"));
        assert!(matches!(result, Err(ProxyError::Io(_))));
    }
}
