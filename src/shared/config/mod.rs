//! Application configuration module
//!
//! Every tunable of the hub and the sync engine lives in [`AppConfig`].
//! Values come from, in order of increasing precedence:
//!
//! 1. the defaults below
//! 2. a TOML file (`HUBSYNC_CONFIG`, or `hubsync.toml` in the working directory)
//! 3. environment variables (`SESSION_MAX_PER_USER`, `RETRY_BASE`, ...)
//!
//! Durations are written as whole seconds in both TOML and the environment.
//!
//! ```toml
//! [session]
//! max_per_user = 4
//! ping_interval = 15
//!
//! [resolver]
//! default_strategy = "merge"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::shared::sync::Strategy;

/// Default config file looked up when `HUBSYNC_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "hubsync.toml";

/// Serde adapter writing a `Duration` as whole seconds
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the server falls back to the in-memory store without one
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret for bearer tokens
    pub jwt_secret: String,
    /// Lifetime of tokens minted by `create_token`
    #[serde(with = "secs")]
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev_secret_key_change_in_production".to_string(),
            token_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Hub session limits and timers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub max_per_user: usize,
    pub outbound_queue: usize,
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    #[serde(with = "secs")]
    pub reap_interval: Duration,
    pub max_message_bytes: usize,
    /// Bad or oversize frames tolerated inside `violation_window`
    pub max_protocol_violations: u32,
    #[serde(with = "secs")]
    pub violation_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_per_user: 10,
            outbound_queue: 128,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            max_message_bytes: 512,
            max_protocol_violations: 3,
            violation_window: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    #[serde(with = "secs")]
    pub op_timeout: Duration,
    /// Non-terminal ops a single user may have queued
    pub max_queue_depth: usize,
    /// Tables clients may mutate through the queue
    pub allowed_tables: Vec<String>,
    /// How long a terminal op keeps its `op_id` reserved
    #[serde(with = "secs")]
    pub idempotency_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            op_timeout: Duration::from_secs(30),
            max_queue_depth: 1000,
            allowed_tables: ["profile", "notes", "tasks", "settings"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            idempotency_window: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "secs")]
    pub base: Duration,
    #[serde(with = "secs")]
    pub max_backoff: Duration,
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(15 * 60),
            max_attempts: 10,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ResolverConfig {
    pub default_strategy: Strategy,
    /// Per-table strategies; per-user overrides are set at runtime
    pub tables: HashMap<String, Strategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Notifications kept per user; older ones are trimmed on insert
    pub inbox_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { inbox_limit: 500 }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub resolver: ResolverConfig,
    pub delivery: DeliveryConfig,
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Load from file and process environment, then validate
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("HUBSYNC_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
            })
        }

        macro_rules! set {
            ($key:literal, secs $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = Duration::from_secs(parsed($key, raw)?);
                }
            };
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parsed($key, raw)?;
                }
            };
        }

        set!("SERVER_PORT", self.server.port);
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        set!("SESSION_MAX_PER_USER", self.session.max_per_user);
        set!("SESSION_OUTBOUND_QUEUE", self.session.outbound_queue);
        set!("SESSION_PING_INTERVAL", secs self.session.ping_interval);
        set!("SESSION_IDLE_TIMEOUT", secs self.session.idle_timeout);
        set!("SESSION_MAX_MESSAGE_BYTES", self.session.max_message_bytes);
        set!("SYNC_BATCH_SIZE", self.sync.batch_size);
        set!("SYNC_OP_TIMEOUT", secs self.sync.op_timeout);
        set!("RETRY_BASE", secs self.retry.base);
        set!("RETRY_MAX_BACKOFF", secs self.retry.max_backoff);
        set!("RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        set!("RETRY_SWEEP_INTERVAL", secs self.retry.sweep_interval);
        set!("RESOLVER_DEFAULT_STRATEGY", self.resolver.default_strategy);
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("session.max_per_user", self.session.max_per_user as u64),
            ("session.outbound_queue", self.session.outbound_queue as u64),
            ("session.max_message_bytes", self.session.max_message_bytes as u64),
            ("session.ping_interval", self.session.ping_interval.as_secs()),
            ("session.idle_timeout", self.session.idle_timeout.as_secs()),
            ("session.reap_interval", self.session.reap_interval.as_secs()),
            ("sync.batch_size", self.sync.batch_size as u64),
            ("sync.op_timeout", self.sync.op_timeout.as_secs()),
            ("sync.max_queue_depth", self.sync.max_queue_depth as u64),
            ("retry.base", self.retry.base.as_secs()),
            ("retry.max_attempts", self.retry.max_attempts as u64),
            ("retry.sweep_interval", self.retry.sweep_interval.as_secs()),
            ("delivery.inbox_limit", self.delivery.inbox_limit as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
            }
        }
        if self.retry.max_backoff < self.retry.base {
            return Err(ConfigError::Invalid(
                "retry.max_backoff must not be shorter than retry.base".to_string(),
            ));
        }
        if self.session.idle_timeout <= self.session.ping_interval {
            return Err(ConfigError::Invalid(
                "session.idle_timeout must be longer than session.ping_interval".to_string(),
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::MissingValue("auth.jwt_secret"));
        }
        Ok(())
    }

    pub fn is_table_allowed(&self, table: &str) -> bool {
        self.sync.allowed_tables.iter().any(|t| t == table)
    }
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.config.server = server;
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database.url = Some(url.into());
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.auth.jwt_secret = secret.into();
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.config.resolver.default_strategy = strategy;
        self
    }

    pub fn table_strategy(mut self, table: impl Into<String>, strategy: Strategy) -> Self {
        self.config.resolver.tables.insert(table.into(), strategy);
        self
    }

    pub fn delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.config.delivery = delivery;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid config file: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
}
