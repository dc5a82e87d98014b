//! HTTP client for the upstream API, bound to a single egress address.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::fetcher::Fetcher;
use super::model::{Identifier, NameChange, NameRecord, Profile};
use crate::error::{ProxyError, Result};
use crate::pool::{EgressIdentity, Pooled};

/// Maximum number of names accepted by one batch lookup.
pub const MAX_BATCH_NAMES: usize = 100;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Where the upstream lives and how long to wait for it.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL of the session server (profiles)
    pub session_url: Url,
    /// Base URL of the account API (names, history)
    pub api_url: Url,
    /// Timeout for a whole request, response body included
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl UpstreamSettings {
    pub fn new(
        session_url: &str,
        api_url: &str,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            session_url: parse_base(session_url)?,
            api_url: parse_base(api_url)?,
            request_timeout,
            connect_timeout,
        })
    }
}

fn parse_base(url: &str) -> Result<Url> {
    let parsed =
        Url::parse(url).map_err(|e| ProxyError::Config(format!("invalid upstream URL {url}: {e}")))?;
    if parsed.cannot_be_a_base() {
        return Err(ProxyError::Config(format!("upstream URL {url} cannot be a base")));
    }
    Ok(parsed)
}

/// Append percent-encoded path segments to a base URL.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Talks to the upstream API from one egress address.
///
/// Every call counts against the identity's rate counter before it is sent.
pub struct UpstreamClient {
    identity: EgressIdentity,
    http: reqwest::Client,
    settings: UpstreamSettings,
}

impl UpstreamClient {
    /// Create a client whose connections originate from the identity's address.
    pub fn new(identity: EgressIdentity, settings: UpstreamSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .local_address(identity.address())
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            identity,
            http,
            settings,
        })
    }

    pub fn identity(&self) -> &EgressIdentity {
        &self.identity
    }

    /// Send a request and classify the response.
    ///
    /// `Ok(None)` means the upstream has no such mapping (204).
    async fn execute(&self, request: RequestBuilder) -> Result<Option<Response>> {
        let count = self.identity.counter().increment();
        trace!(
            address = %self.identity.address(),
            count = count,
            limit = self.identity.rate_limit(),
            "Dispatching upstream request"
        );

        let response = request.send().await?;
        let status = response.status();

        debug!(
            address = %self.identity.address(),
            url = %response.url(),
            status = status.as_u16(),
            "Upstream responded"
        );

        match status {
            StatusCode::OK => Ok(Some(response)),
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(ProxyError::RateLimited {
                address: self.identity.address(),
            }),
            other => Err(ProxyError::UpstreamProtocol {
                status: other.as_u16(),
            }),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        match self.execute(request).await? {
            Some(response) => {
                let body = response.bytes().await?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Fetcher for UpstreamClient {
    async fn find_profile(&self, id: &Identifier) -> Result<Option<Profile>> {
        let url = endpoint(
            &self.settings.session_url,
            &["session", "minecraft", "profile", &id.to_compact()],
        );
        let profile: Option<Profile> = self
            .fetch(self.http.get(url).query(&[("unsigned", "false")]))
            .await?;

        Ok(profile.map(|mut profile| {
            profile.decode_textures();
            profile
        }))
    }

    async fn find_identifier(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<Option<NameRecord>> {
        let url = endpoint(&self.settings.api_url, &["users", "profiles", "minecraft", name]);
        let mut request = self.http.get(url);
        if let Some(at) = at {
            request = request.query(&[("at", at.timestamp())]);
        }
        self.fetch(request).await
    }

    async fn find_identifiers(&self, names: &[String]) -> Result<Vec<NameRecord>> {
        if names.len() > MAX_BATCH_NAMES {
            return Err(ProxyError::InvalidRequest(format!(
                "cannot look up more than {MAX_BATCH_NAMES} names at once"
            )));
        }

        let url = endpoint(&self.settings.api_url, &["profiles", "minecraft"]);
        let records = self.fetch(self.http.post(url).json(names)).await?;
        Ok(records.unwrap_or_default())
    }

    async fn name_history(&self, id: &Identifier) -> Result<Option<Vec<NameChange>>> {
        let url = endpoint(
            &self.settings.api_url,
            &["user", "profiles", &id.to_compact(), "names"],
        );
        self.fetch(self.http.get(url)).await
    }
}

impl Pooled for UpstreamClient {
    fn identity(&self) -> &EgressIdentity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UpstreamSettings {
        UpstreamSettings::new(
            "https://sessionserver.mojang.com",
            "https://api.mojang.com/",
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_building() {
        let settings = settings();

        let url = endpoint(&settings.api_url, &["users", "profiles", "minecraft", "Notch"]);
        assert_eq!(url.as_str(), "https://api.mojang.com/users/profiles/minecraft/Notch");

        let url = endpoint(&settings.session_url, &["session", "minecraft", "profile", "abc"]);
        assert_eq!(url.as_str(), "https://sessionserver.mojang.com/session/minecraft/profile/abc");
    }

    #[test]
    fn test_endpoint_encodes_names() {
        let settings = settings();
        let url = endpoint(&settings.api_url, &["users", "profiles", "minecraft", "a b/c"]);
        assert_eq!(url.as_str(), "https://api.mojang.com/users/profiles/minecraft/a%20b%2Fc");
    }

    #[test]
    fn test_invalid_upstream_url() {
        let err = UpstreamSettings::new(
            "not a url",
            "https://api.mojang.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));

        let err = UpstreamSettings::new(
            "https://sessionserver.mojang.com",
            "mailto:someone@example.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[tokio::test]
    async fn test_oversized_batch_is_rejected_before_dispatch() {
        let identity = EgressIdentity::new("127.0.0.1".parse().unwrap(), 600);
        let client = UpstreamClient::new(identity, settings()).unwrap();
        let names: Vec<String> = (0..=MAX_BATCH_NAMES).map(|i| format!("player{i}")).collect();

        let err = client.find_identifiers(&names).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert_eq!(client.identity().counter().get(), 0);
    }
}
