// Configuration for the pairchat relay server
//
// Resolution order, later wins:
// 1. built-in defaults
// 2. JSON file (--config, else <config dir>/pairchat/relay.json if present)
// 3. environment variables
// 4. command-line flags
//
// Everything is read once at start-up.

use anyhow::{Context, Result};
use pairchat_core::relay::{
    HmacCredentialIssuer, RateLimitConfig, RelayConfig, UpstreamConfig, UpstreamCredentialIssuer,
};
use pairchat_core::CredentialIssuer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warp::http::{HeaderValue, Uri};

/// Accept exactly what the CORS filter accepts: `http(s)://authority`,
/// usable as a header value, with no path, query or credentials.
fn check_origin(origin: &str) -> Result<()> {
    let bad = || format!("frontend_origin must be http(s)://host[:port], got {}", origin);

    HeaderValue::from_str(origin).with_context(bad)?;
    let uri: Uri = origin.parse().with_context(bad)?;
    if !matches!(uri.scheme_str(), Some("http" | "https")) {
        anyhow::bail!(bad());
    }
    let authority = uri.authority().with_context(bad)?;
    if authority.host().is_empty() || authority.as_str().contains('@') {
        anyhow::bail!(bad());
    }
    if uri.query().is_some() || !matches!(uri.path(), "" | "/") || origin.ends_with('/') {
        anyhow::bail!(bad());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP + WebSocket listen port
    pub port: u16,

    /// Origin allowed by CORS; "*" allows any
    pub frontend_origin: String,

    /// Maximum concurrent signalling sockets
    pub max_connections: usize,

    /// Relay credential settings
    pub credentials: CredentialConfig,

    /// Rate limit settings
    pub rate_limits: RateLimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialConfig {
    /// TURN/STUN host handed to clients
    pub turn_domain: String,

    /// Secret shared with the TURN server
    pub turn_secret: String,

    /// Credential lifetime in seconds
    pub lifetime_secs: u64,

    /// External ICE provider; when set it replaces the HMAC strategy
    pub provider_url: Option<String>,

    pub provider_api_key: Option<String>,

    /// Ports never handed out from the provider's list
    pub disallowed_ports: Vec<u16>,

    /// Provider response cache lifetime in seconds
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub socket_points: u32,
    pub socket_window_ms: u64,
    pub http_points: u32,
    pub http_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            frontend_origin: "http://localhost:3000".to_string(),
            max_connections: 1000,
            credentials: CredentialConfig::default(),
            rate_limits: RateLimitSettings::default(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            turn_domain: String::new(),
            turn_secret: String::new(),
            lifetime_secs: 86_400,
            provider_url: None,
            provider_api_key: None,
            disallowed_ports: vec![80],
            cache_ttl_secs: 3600,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let socket = RateLimitConfig::socket_events();
        let http = RateLimitConfig::credential_requests();
        Self {
            socket_points: socket.points,
            socket_window_ms: socket.window.as_millis() as u64,
            http_points: http.points,
            http_window_ms: http.window.as_millis() as u64,
        }
    }
}

impl Config {
    /// Default config file location
    pub fn config_file() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("pairchat")
            .join("relay.json"))
    }

    /// Load from an explicit file, or the default location when present,
    /// or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::config_file() {
                Ok(default_file) if default_file.exists() => Self::load_from(&default_file),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        const KEYS: &[(&str, &str)] = &[
            ("PORT", "port"),
            ("FRONTEND_ORIGIN", "frontend_origin"),
            ("MAX_CONNECTIONS", "max_connections"),
            ("TURN_DOMAIN", "turn_domain"),
            ("TURN_SECRET", "turn_secret"),
            ("TURN_SECRET_LIFETIME_SECONDS", "lifetime_secs"),
            ("ICE_PROVIDER_URL", "provider_url"),
            ("ICE_PROVIDER_API_KEY", "provider_api_key"),
            ("SOCKET_RATE_POINTS", "socket_points"),
            ("SOCKET_RATE_WINDOW_MS", "socket_window_ms"),
            ("HTTP_RATE_POINTS", "http_points"),
            ("HTTP_RATE_WINDOW_MS", "http_window_ms"),
        ];

        for (var, key) in KEYS {
            if let Some(value) = lookup(var) {
                self.set(key, &value)
                    .with_context(|| format!("Invalid value for {}", var))?;
            }
        }
        Ok(())
    }

    /// Set a config value by key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "port" => self.port = value.parse().context("Invalid port number")?,
            "frontend_origin" => self.frontend_origin = value.to_string(),
            "max_connections" => {
                self.max_connections = value.parse().context("Invalid number")?
            }
            "turn_domain" => self.credentials.turn_domain = value.to_string(),
            "turn_secret" => self.credentials.turn_secret = value.to_string(),
            "lifetime_secs" => {
                self.credentials.lifetime_secs = value.parse().context("Invalid number")?
            }
            "provider_url" => self.credentials.provider_url = non_empty(value),
            "provider_api_key" => self.credentials.provider_api_key = non_empty(value),
            "cache_ttl_secs" => {
                self.credentials.cache_ttl_secs = value.parse().context("Invalid number")?
            }
            "disallowed_ports" => {
                self.credentials.disallowed_ports = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| p.parse::<u16>().context("Invalid port number"))
                    .collect::<Result<_>>()?
            }
            "socket_points" => {
                self.rate_limits.socket_points = value.parse().context("Invalid number")?
            }
            "socket_window_ms" => {
                self.rate_limits.socket_window_ms = value.parse().context("Invalid number")?
            }
            "http_points" => {
                self.rate_limits.http_points = value.parse().context("Invalid number")?
            }
            "http_window_ms" => {
                self.rate_limits.http_window_ms = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value by key. The TURN secret is never echoed.
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let secret = if self.credentials.turn_secret.is_empty() {
            "(unset)"
        } else {
            "(set)"
        };
        vec![
            ("port".to_string(), self.port.to_string()),
            ("frontend_origin".to_string(), self.frontend_origin.clone()),
            ("max_connections".to_string(), self.max_connections.to_string()),
            ("strategy".to_string(), self.strategy().to_string()),
            ("turn_domain".to_string(), self.credentials.turn_domain.clone()),
            ("turn_secret".to_string(), secret.to_string()),
            ("lifetime_secs".to_string(), self.credentials.lifetime_secs.to_string()),
            (
                "provider_url".to_string(),
                self.credentials.provider_url.clone().unwrap_or_else(|| "(none)".to_string()),
            ),
            (
                "disallowed_ports".to_string(),
                self.credentials
                    .disallowed_ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("cache_ttl_secs".to_string(), self.credentials.cache_ttl_secs.to_string()),
            ("socket_points".to_string(), self.rate_limits.socket_points.to_string()),
            ("socket_window_ms".to_string(), self.rate_limits.socket_window_ms.to_string()),
            ("http_points".to_string(), self.rate_limits.http_points.to_string()),
            ("http_window_ms".to_string(), self.rate_limits.http_window_ms.to_string()),
        ]
    }

    /// Credential strategy label
    pub fn strategy(&self) -> &'static str {
        if self.credentials.provider_url.is_some() {
            "upstream"
        } else {
            "hmac"
        }
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.frontend_origin != "*" {
            check_origin(&self.frontend_origin)?;
        }

        match self.strategy() {
            "upstream" => {
                if self.credentials.provider_api_key.is_none() {
                    anyhow::bail!("ICE_PROVIDER_API_KEY is required with ICE_PROVIDER_URL");
                }
            }
            _ => {
                if self.credentials.turn_secret.is_empty() {
                    anyhow::bail!("TURN_SECRET must be set");
                }
                if self.credentials.turn_domain.is_empty() {
                    anyhow::bail!("TURN_DOMAIN must be set");
                }
            }
        }

        if self.rate_limits.socket_points == 0 || self.rate_limits.http_points == 0 {
            anyhow::bail!("Rate limit points must be positive");
        }
        if self.rate_limits.socket_window_ms == 0 || self.rate_limits.http_window_ms == 0 {
            anyhow::bail!("Rate limit windows must be positive");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be positive");
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_connections: self.max_connections,
            socket_rate: RateLimitConfig {
                points: self.rate_limits.socket_points,
                window: Duration::from_millis(self.rate_limits.socket_window_ms),
            },
        }
    }

    pub fn http_rate(&self) -> RateLimitConfig {
        RateLimitConfig {
            points: self.rate_limits.http_points,
            window: Duration::from_millis(self.rate_limits.http_window_ms),
        }
    }

    /// Build the configured credential issuer
    pub fn credential_issuer(&self) -> Arc<dyn CredentialIssuer> {
        let creds = &self.credentials;
        match &creds.provider_url {
            Some(url) => {
                let mut upstream =
                    UpstreamConfig::new(url.clone(), creds.provider_api_key.clone().unwrap_or_default());
                upstream.disallowed_ports = creds.disallowed_ports.clone();
                upstream.cache_ttl = Duration::from_secs(creds.cache_ttl_secs);
                Arc::new(UpstreamCredentialIssuer::new(upstream))
            }
            None => Arc::new(HmacCredentialIssuer::new(
                creds.turn_secret.clone(),
                creds.turn_domain.clone(),
                Duration::from_secs(creds.lifetime_secs),
            )),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
