//! Configuration Module
//!
//! Provides TOML-based configuration for FanBridge with support for:
//! - Logging level
//! - Broker connection settings
//! - Downstream gateway (WebSocket / Server-Sent Events) settings
//! - Broadcast behaviour
//! - Metrics
//! - Environment variable overrides (FANBRIDGE__* prefix)
//!
//! The flat `MQTT_*` keys read through [`Settings`] are layered around the
//! file: values from `environments/default.env` sit beneath the TOML file and
//! `FANBRIDGE__*` overrides, while values from `environments/<APP_ENV>.env` or
//! the process environment win over both.

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::{
    BrokerConfig, BROKER_SETTINGS, BROKER_URL_KEY, CONNECT_TIMEOUT_KEY, RECONNECT_PERIOD_KEY,
};
pub use settings::{Settings, ENVIRONMENT_KEY};

mod broker;
mod settings;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Environment file could not be read
    EnvFile(String),
    /// Required key is absent
    Missing(String),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::EnvFile(msg) => write!(f, "Environment file error: {}", msg),
            ConfigError::Missing(key) => write!(f, "Required setting {} is not set", key),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
    /// Downstream gateway configuration
    pub gateway: GatewayConfig,
    /// Broadcast configuration
    pub broadcast: BroadcastConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Downstream gateway configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP bind address (Server-Sent Events, health and metrics)
    #[serde(default = "default_http_bind")]
    pub http_bind: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket path
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Server-Sent Events path
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    /// Broker topic bridged to every downstream connection
    #[serde(default = "default_topic")]
    pub topic: String,
    /// `kind` field of events pushed downstream
    #[serde(default = "default_event_kind")]
    pub event_kind: String,
    /// Interval between Server-Sent Events keep-alive comments, in seconds
    #[serde(default = "default_sse_keep_alive")]
    pub sse_keep_alive: u64,
}

fn default_http_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_ws_path() -> String {
    "/api/internal".to_string()
}

fn default_sse_path() -> String {
    "/api/events".to_string()
}

fn default_topic() -> String {
    "mqtt/topic".to_string()
}

fn default_event_kind() -> String {
    "mqtt".to_string()
}

fn default_sse_keep_alive() -> u64 {
    15
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_bind: default_http_bind(),
            ws_bind: None,
            ws_path: default_ws_path(),
            sse_path: default_sse_path(),
            topic: default_topic(),
            event_kind: default_event_kind(),
            sse_keep_alive: default_sse_keep_alive(),
        }
    }
}

/// Broadcast configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Drop a channel from the live set after a failed write
    #[serde(default = "default_true")]
    pub auto_unregister: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            auto_unregister: true,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether `/metrics` is served on the gateway HTTP server
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl GatewayConfig {
    /// Get the SSE keep-alive interval as Duration
    pub fn sse_keep_alive_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sse_keep_alive)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FANBRIDGE__` prefix with double underscores for nesting:
    ///    - `FANBRIDGE__BROKER__URL=mqtt://broker:1883` overrides `broker.url`
    ///    - `FANBRIDGE__GATEWAY__TOPIC=sensors/room1` overrides `gateway.topic`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_layered(path.as_ref(), None)
    }

    /// Load like [`load`](Self::load), layering the `MQTT_*` keys of
    /// `settings` around the file.
    ///
    /// Precedence, lowest first: built-in defaults, `default.env`, the TOML
    /// file, `FANBRIDGE__*` variables, then `<APP_ENV>.env` and the process
    /// environment.
    pub fn load_with_settings<P: AsRef<Path>>(
        path: P,
        settings: &Settings,
    ) -> Result<Self, ConfigError> {
        Self::load_layered(path.as_ref(), Some(settings))
    }

    fn load_layered(path: &Path, settings: Option<&Settings>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("gateway.ws_path", default_ws_path())?
            .set_default("gateway.sse_path", default_sse_path())?
            .set_default("gateway.topic", default_topic())?
            .set_default("gateway.event_kind", default_event_kind())?
            .set_default("gateway.sse_keep_alive", default_sse_keep_alive())?
            .set_default("broadcast.auto_unregister", true)?
            .set_default("metrics.enabled", true)?;

        if let Some(settings) = settings {
            for (key, field) in BROKER_SETTINGS {
                if let Some(value) = settings.get_default::<String>(key)? {
                    builder = builder.set_default(field, value)?;
                }
            }
        }

        // Load from file with env var substitution
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("FANBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        if let Some(settings) = settings {
            config.broker.apply_settings(settings)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// [`from_env`](Self::from_env) with `settings` layered as in
    /// [`load_with_settings`](Self::load_with_settings)
    pub fn from_env_with_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::load_with_settings(Path::new(""), settings)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the `MQTT_*` keys from the override layer of `settings` and
    /// re-validate
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        self.broker.apply_settings(settings)?;
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        if !matches!(
            self.log.level.to_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError::Validation(format!(
                "Unknown log level '{}'",
                self.log.level
            )));
        }

        if self.gateway.topic.is_empty() {
            return Err(ConfigError::Validation(
                "gateway.topic must not be empty".to_string(),
            ));
        }
        if self.gateway.topic.contains(['+', '#']) {
            return Err(ConfigError::Validation(format!(
                "gateway.topic '{}' must be an exact topic (no wildcards)",
                self.gateway.topic
            )));
        }

        for (name, path) in [
            ("gateway.ws_path", &self.gateway.ws_path),
            ("gateway.sse_path", &self.gateway.sse_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "{} must start with '/'",
                    name
                )));
            }
        }

        if self.gateway.sse_keep_alive == 0 {
            return Err(ConfigError::Validation(
                "gateway.sse_keep_alive must be greater than 0".to_string(),
            ));
        }

        if self.gateway.ws_bind == Some(self.gateway.http_bind) {
            return Err(ConfigError::Validation(
                "gateway.ws_bind must differ from gateway.http_bind".to_string(),
            ));
        }

        Ok(())
    }
}
