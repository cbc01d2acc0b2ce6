//! Relay credentials — short-lived STUN/TURN descriptors for clients
//!
//! Two interchangeable strategies sit behind [`CredentialIssuer`]:
//!
//! - [`HmacCredentialIssuer`] derives TURN REST credentials locally: the
//!   username embeds an expiry timestamp and the password is an HMAC-SHA1 of
//!   that username under a secret shared with the TURN server. Nothing is
//!   stored; the TURN server re-derives and checks the expiry itself.
//! - [`UpstreamCredentialIssuer`] asks an external provider for its ICE
//!   server list, drops descriptors on disallowed ports, and caches the
//!   result no longer than the configured TTL.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::Duration;
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// Default credential lifetime: one day
pub const DEFAULT_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(86_400);

/// One or more URLs of an ICE server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    Single(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let urls: &[String] = match self {
            IceUrls::Single(url) => std::slice::from_ref(url),
            IceUrls::Many(urls) => urls,
        };
        urls.iter().map(String::as_str)
    }
}

/// ICE server descriptor (`RTCIceServer`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Descriptor without credentials (STUN)
    pub fn open(url: impl Into<String>) -> Self {
        Self {
            urls: IceUrls::Single(url.into()),
            username: None,
            credential: None,
        }
    }

    /// Descriptor carrying a TURN credential
    pub fn authenticated(url: impl Into<String>, credential: &RelayCredential) -> Self {
        Self {
            urls: IceUrls::Single(url.into()),
            username: Some(credential.turn_username.clone()),
            credential: Some(credential.turn_password.clone()),
        }
    }
}

/// Time-limited TURN authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredential {
    pub turn_username: String,
    pub turn_password: String,
    /// Unix timestamp (seconds) after which the TURN server refuses it
    pub expiry: u64,
}

/// Credential issuance errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Upstream credential provider unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("TURN secret is empty")]
    InvalidSecret,
}

/// Produces ICE server descriptors for a named client
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue descriptors for `subject` (the client's pseudonym)
    async fn issue(&self, subject: &str) -> Result<Vec<IceServer>, CredentialError>;

    /// Short strategy label for logs
    fn strategy(&self) -> &'static str;
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// HMAC STRATEGY
// ============================================================================

/// Locally derived TURN REST credentials
#[derive(Clone)]
pub struct HmacCredentialIssuer {
    secret: String,
    domain: String,
    lifetime: Duration,
}

impl std::fmt::Debug for HmacCredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacCredentialIssuer")
            .field("domain", &self.domain)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl HmacCredentialIssuer {
    pub fn new(secret: impl Into<String>, domain: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            domain: domain.into(),
            lifetime,
        }
    }

    /// Derive the credential for `subject` as of `now` (unix seconds)
    pub fn credential_at(&self, subject: &str, now: u64) -> Result<RelayCredential, CredentialError> {
        let expiry = now + self.lifetime.as_secs();
        let turn_username = format!("{}:{}", expiry, subject);

        // HMAC takes keys of any length, the empty one included
        if self.secret.is_empty() {
            return Err(CredentialError::InvalidSecret);
        }
        let mut mac = HmacSha1::new_from_slice(self.secret.as_bytes())
            .map_err(|_| CredentialError::InvalidSecret)?;
        mac.update(turn_username.as_bytes());
        let turn_password = Base64.encode(mac.finalize().into_bytes());

        Ok(RelayCredential {
            turn_username,
            turn_password,
            expiry,
        })
    }

    /// STUN plus TURN over TLS and plain TURN, all on the configured domain
    pub fn ice_servers(&self, credential: &RelayCredential) -> Vec<IceServer> {
        vec![
            IceServer::open(format!("stun:{}:3478", self.domain)),
            IceServer::authenticated(format!("turns:{}:443", self.domain), credential),
            IceServer::authenticated(format!("turn:{}:3478", self.domain), credential),
        ]
    }
}

#[async_trait]
impl CredentialIssuer for HmacCredentialIssuer {
    async fn issue(&self, subject: &str) -> Result<Vec<IceServer>, CredentialError> {
        let credential = self.credential_at(subject, unix_now())?;
        tracing::debug!(
            "Issued TURN credential for {} (expires {})",
            subject,
            credential.expiry
        );
        Ok(self.ice_servers(&credential))
    }

    fn strategy(&self) -> &'static str {
        "hmac"
    }
}

// ============================================================================
// UPSTREAM STRATEGY
// ============================================================================

/// Port an ICE URL connects to, with scheme defaults when absent
pub fn ice_url_port(url: &str) -> Option<u16> {
    let (scheme, rest) = url.split_once(':')?;
    let rest = rest.split('?').next().unwrap_or(rest);
    let rest = rest.trim_start_matches("//");

    let explicit = rest
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse::<u16>().ok());

    explicit.or(match scheme {
        "stun" | "turn" => Some(3478),
        "stuns" | "turns" => Some(5349),
        _ => None,
    })
}

/// Drop every descriptor with a URL on one of `disallowed_ports`
pub fn filter_disallowed_ports(servers: Vec<IceServer>, disallowed_ports: &[u16]) -> Vec<IceServer> {
    servers
        .into_iter()
        .filter(|server| {
            server.urls.iter().all(|url| match ice_url_port(url) {
                Some(port) => !disallowed_ports.contains(&port),
                None => false,
            })
        })
        .collect()
}

/// Upstream provider settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Provider endpoint returning a JSON array of ICE servers
    pub endpoint: String,
    pub api_key: String,
    /// Descriptors on these ports are never handed out
    pub disallowed_ports: Vec<u16>,
    /// How long a fetched list may be reused
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            disallowed_ports: vec![80],
            cache_ttl: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct CachedServers {
    servers: Vec<IceServer>,
    fetched_at: web_time::Instant,
}

/// Proxies an external ICE credential provider
pub struct UpstreamCredentialIssuer {
    config: UpstreamConfig,
    cache: parking_lot::Mutex<Option<CachedServers>>,
}

impl UpstreamCredentialIssuer {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            cache: parking_lot::Mutex::new(None),
        }
    }

    /// Cached list, if still within the TTL
    pub fn cached(&self) -> Option<Vec<IceServer>> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.config.cache_ttl)
            .map(|entry| entry.servers.clone())
    }

    fn store(&self, servers: Vec<IceServer>) {
        *self.cache.lock() = Some(CachedServers {
            servers,
            fetched_at: web_time::Instant::now(),
        });
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn fetch(&self) -> Result<Vec<IceServer>, CredentialError> {
        let endpoint = self.config.endpoint.clone();
        let api_key = self.config.api_key.clone();
        let timeout = self.config.request_timeout;

        tokio::task::spawn_blocking(move || {
            ureq::get(&endpoint)
                .query("apiKey", &api_key)
                .timeout(timeout)
                .call()
                .map_err(|e| CredentialError::UpstreamUnavailable(e.to_string()))?
                .into_json::<Vec<IceServer>>()
                .map_err(|e| CredentialError::UpstreamUnavailable(e.to_string()))
        })
        .await
        .map_err(|e| CredentialError::UpstreamUnavailable(e.to_string()))?
    }

    #[cfg(target_arch = "wasm32")]
    async fn fetch(&self) -> Result<Vec<IceServer>, CredentialError> {
        Err(CredentialError::UpstreamUnavailable(
            "upstream provider not reachable from wasm".to_string(),
        ))
    }
}

#[async_trait]
impl CredentialIssuer for UpstreamCredentialIssuer {
    async fn issue(&self, subject: &str) -> Result<Vec<IceServer>, CredentialError> {
        if let Some(servers) = self.cached() {
            return Ok(servers);
        }

        let fetched = self.fetch().await?;
        let servers = filter_disallowed_ports(fetched, &self.config.disallowed_ports);
        tracing::info!(
            "Fetched {} ICE servers from upstream for {}",
            servers.len(),
            subject
        );
        self.store(servers.clone());
        Ok(servers)
    }

    fn strategy(&self) -> &'static str {
        "upstream"
    }
}

// ============================================================================
// TESTS
// ============================================================================
