//! Key/Value Settings
//!
//! Flat, read-only lookup of string keys such as `MQTT_BROKER_URL`. Values
//! come from two layers:
//! - defaults: `environments/default.env`
//! - overrides: `environments/<APP_ENV>.env`, then the process environment
//!
//! Overrides win over defaults and later sources win within a layer. Keys
//! are matched case-insensitively.

use std::path::Path;

use config::builder::DefaultState;
use config::{Config as RawConfig, ConfigBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::ConfigError;

/// Environment variable selecting the environment file overlay
pub const ENVIRONMENT_KEY: &str = "APP_ENV";

const DEFAULT_ENVIRONMENT: &str = "development";
const ENVIRONMENT_DIR: &str = "environments";
const DEFAULTS_FILE: &str = "default.env";

/// Read-only key/value provider
#[derive(Debug, Clone)]
pub struct Settings {
    defaults: RawConfig,
    overrides: RawConfig,
}

impl Settings {
    /// Settings backed by the process environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builders(
            RawConfig::builder(),
            with_pairs(RawConfig::builder(), std::env::vars())?,
        )
    }

    /// Settings from environment files under `root/environments` overlaid
    /// by the process environment.
    ///
    /// Missing files are skipped; a file that exists but cannot be parsed is
    /// an error.
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(ENVIRONMENT_KEY).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string());
        let dir = root.as_ref().join(ENVIRONMENT_DIR);

        let defaults = with_file(RawConfig::builder(), &dir.join(DEFAULTS_FILE))?;
        let overrides = with_file(
            RawConfig::builder(),
            &dir.join(format!("{}.env", environment)),
        )?;
        let overrides = with_pairs(overrides, std::env::vars())?;

        Self::from_builders(defaults, overrides)
    }

    /// Settings from explicit override pairs (no environment)
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::from_builders(RawConfig::builder(), builder_from(pairs)?)
    }

    /// Settings from explicit default and override pairs
    pub fn from_layers<I, J, K, V>(defaults: I, overrides: J) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        J: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::from_builders(builder_from(defaults)?, builder_from(overrides)?)
    }

    fn from_builders(
        defaults: ConfigBuilder<DefaultState>,
        overrides: ConfigBuilder<DefaultState>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            defaults: defaults.build()?,
            overrides: overrides.build()?,
        })
    }

    /// Optional lookup: `None` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match lookup(&self.overrides, key)? {
            Some(value) => Ok(Some(value)),
            None => lookup(&self.defaults, key),
        }
    }

    /// Required lookup: error when the key is absent
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Defaulted lookup: `default` when the key is absent
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Lookup in the override layer only, ignoring `default.env`
    pub fn get_override<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        lookup(&self.overrides, key)
    }

    /// Lookup in the `default.env` layer only
    pub fn get_default<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        lookup(&self.defaults, key)
    }

    /// Whether the key is present
    pub fn contains(&self, key: &str) -> bool {
        let key = normalize(key);
        self.overrides.get_string(&key).is_ok() || self.defaults.get_string(&key).is_ok()
    }
}

fn lookup<T: DeserializeOwned>(layer: &RawConfig, key: &str) -> Result<Option<T>, ConfigError> {
    match layer.get::<T>(&normalize(key)) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(ConfigError::Config(e)),
    }
}

/// Keys are flat; dots would be read as nested paths
fn normalize(key: &str) -> String {
    key.to_lowercase().replace('.', "_")
}

fn builder_from<I, K, V>(pairs: I) -> Result<ConfigBuilder<DefaultState>, ConfigError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    with_pairs(
        RawConfig::builder(),
        pairs.into_iter().map(|(k, v)| (k.into(), v.into())),
    )
}

fn with_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if !path.exists() {
        return Ok(builder);
    }
    debug!("Settings: Loading {:?}", path);
    let pairs = dotenvy::from_path_iter(path)
        .map_err(|e| ConfigError::EnvFile(format!("{}: {}", path.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::EnvFile(format!("{}: {}", path.display(), e)))?;
    with_pairs(builder, pairs)
}

fn with_pairs<I>(
    mut builder: ConfigBuilder<DefaultState>,
    pairs: I,
) -> Result<ConfigBuilder<DefaultState>, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in pairs {
        let key = normalize(&key);
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        builder = builder.set_override(key, value)?;
    }
    Ok(builder)
}
