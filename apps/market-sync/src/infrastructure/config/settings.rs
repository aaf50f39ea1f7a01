//! Synchronizer Configuration Settings
//!
//! Configuration types for the market-sync service, loaded from environment
//! variables. Every value except the two endpoint URLs has a default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;

use crate::domain::credentials::Credential;
use crate::domain::table::MergePolicy;

/// Backend REST API settings.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Base URL of the REST API.
    pub base_url: Url,
    /// Snapshot endpoint paths, merged in order.
    pub snapshot_paths: Vec<String>,
    /// Token refresh endpoint path.
    pub refresh_path: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl ApiSettings {
    /// Default snapshot path.
    pub const DEFAULT_SNAPSHOT_PATH: &'static str = "/api/prices";
    /// Default refresh path.
    pub const DEFAULT_REFRESH_PATH: &'static str = "/api/auth/refresh";
    /// Default request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Streaming connection settings.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// STOMP-over-WebSocket URL.
    pub url: Url,
    /// Delta topic.
    pub topic: String,
    /// Outgoing heart-beat interval offered to the server.
    pub heartbeat_outgoing: Duration,
    /// Incoming heart-beat interval requested from the server.
    pub heartbeat_incoming: Duration,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Reconnection jitter factor (0 = exact delays).
    pub reconnect_jitter: f64,
}

impl StreamSettings {
    /// Default delta topic.
    pub const DEFAULT_TOPIC: &'static str = "/topic/prices";
    /// Default heart-beat interval in both directions.
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
    /// Default reconnect base delay.
    pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    /// Default reconnect attempt ceiling.
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
}

/// Credential storage settings.
#[derive(Clone, Default)]
pub struct CredentialSettings {
    /// JSON token file; in-memory storage when unset.
    pub token_store_path: Option<PathBuf>,
    /// Tokens to store at startup, standing in for an interactive login.
    pub seed: Option<Credential>,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("token_store_path", &self.token_store_path)
            .field("seed", &self.seed.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST API settings.
    pub api: ApiSettings,
    /// Streaming settings.
    pub stream: StreamSettings,
    /// Credential storage settings.
    pub credentials: CredentialSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Delta merge policy.
    pub merge: MergePolicy,
}

impl SyncConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or URLs are invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or URLs are invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let api = ApiSettings {
            base_url: env.url("MARKET_SYNC_API_BASE_URL", &["http", "https"])?,
            snapshot_paths: env.list(
                "MARKET_SYNC_SNAPSHOT_PATHS",
                ApiSettings::DEFAULT_SNAPSHOT_PATH,
            ),
            refresh_path: env
                .get("MARKET_SYNC_REFRESH_PATH")
                .unwrap_or_else(|| ApiSettings::DEFAULT_REFRESH_PATH.to_string()),
            request_timeout: env.duration_secs(
                "MARKET_SYNC_REQUEST_TIMEOUT_SECS",
                ApiSettings::DEFAULT_REQUEST_TIMEOUT,
            ),
        };

        let stream = StreamSettings {
            url: env.url("MARKET_SYNC_STREAM_URL", &["ws", "wss"])?,
            topic: env
                .get("MARKET_SYNC_TOPIC")
                .unwrap_or_else(|| StreamSettings::DEFAULT_TOPIC.to_string()),
            heartbeat_outgoing: env.duration_millis(
                "MARKET_SYNC_HEARTBEAT_OUTGOING_MS",
                StreamSettings::DEFAULT_HEARTBEAT,
            ),
            heartbeat_incoming: env.duration_millis(
                "MARKET_SYNC_HEARTBEAT_INCOMING_MS",
                StreamSettings::DEFAULT_HEARTBEAT,
            ),
            reconnect_base_delay: env.duration_millis(
                "MARKET_SYNC_RECONNECT_BASE_DELAY_MS",
                StreamSettings::DEFAULT_RECONNECT_BASE_DELAY,
            ),
            max_reconnect_attempts: env.parse(
                "MARKET_SYNC_MAX_RECONNECT_ATTEMPTS",
                StreamSettings::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            reconnect_jitter: env.fraction("MARKET_SYNC_RECONNECT_JITTER"),
        };

        let seed = match (
            env.get("MARKET_SYNC_ACCESS_TOKEN"),
            env.get("MARKET_SYNC_REFRESH_TOKEN"),
        ) {
            (Some(access), Some(refresh)) => Some(Credential::new(access, refresh)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::MissingEnvVar(
                    "MARKET_SYNC_REFRESH_TOKEN".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::MissingEnvVar(
                    "MARKET_SYNC_ACCESS_TOKEN".to_string(),
                ));
            }
        };

        let credentials = CredentialSettings {
            token_store_path: env.get("MARKET_SYNC_TOKEN_STORE_PATH").map(PathBuf::from),
            seed,
        };

        let server = ServerSettings {
            health_port: env.parse(
                "MARKET_SYNC_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let merge = MergePolicy::from_reject_stale(env.flag("MARKET_SYNC_REJECT_STALE_DELTAS"));

        Ok(Self {
            api,
            stream,
            credentials,
            server,
            merge,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is not a usable URL.
    #[error("environment variable {key} is not a valid URL: {reason}")]
    InvalidUrl {
        /// Variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Environment lookup with typed accessors. Blank values count as unset.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        match (self.0)(key) {
            None => Err(ConfigError::MissingEnvVar(key.to_string())),
            Some(v) if v.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn url(&self, key: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
        let raw = self.required(key)?;
        let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        if !schemes.contains(&url.scheme()) {
            return Err(ConfigError::InvalidUrl {
                key: key.to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        Ok(url)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// A value in `0..=1`; anything unparsable or non-finite reads as 0.
    fn fraction(&self, key: &str) -> f64 {
        let value = self.parse(key, 0.0_f64);
        if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        let raw = self.get(key).unwrap_or_else(|| default.to_string());
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
