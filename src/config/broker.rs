//! Broker Connection Configuration
//!
//! Settings for the single shared MQTT connection.

use std::time::Duration;

use serde::Deserialize;

use super::{ConfigError, Settings};

/// Settings key for the broker URL
pub const BROKER_URL_KEY: &str = "MQTT_BROKER_URL";
/// Settings key for the connect timeout (milliseconds)
pub const CONNECT_TIMEOUT_KEY: &str = "MQTT_CONNECT_TIMEOUT";
/// Settings key for the reconnect period (milliseconds)
pub const RECONNECT_PERIOD_KEY: &str = "MQTT_RECONNECT_PERIOD";

/// `MQTT_*` settings keys and the `[broker]` fields they feed
pub const BROKER_SETTINGS: [(&str, &str); 3] = [
    (BROKER_URL_KEY, "broker.url"),
    (CONNECT_TIMEOUT_KEY, "broker.connect_timeout"),
    (RECONNECT_PERIOD_KEY, "broker.reconnect_period"),
];

const DEFAULT_PORT: u16 = 1883;

/// Configuration for the broker connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker endpoint (`mqtt://host:port`, `tcp://host:port` or `host:port`)
    #[serde(default = "default_url")]
    pub url: String,

    /// Client ID presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period: u64,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// QoS requested for every subscription (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,

    /// How long to wait for a SUBACK/UNSUBACK, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: u64,

    /// Capacity of the client library's request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    format!("fanbridge-{}", uuid::Uuid::new_v4().simple())
}

fn default_connect_timeout() -> u64 {
    4000
}

fn default_reconnect_period() -> u64 {
    1000
}

fn default_keep_alive() -> u64 {
    30
}

fn default_ack_timeout() -> u64 {
    10_000
}

fn default_request_capacity() -> usize {
    64
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            client_id: default_client_id(),
            connect_timeout: default_connect_timeout(),
            reconnect_period: default_reconnect_period(),
            keep_alive: default_keep_alive(),
            qos: 0,
            ack_timeout: default_ack_timeout(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl BrokerConfig {
    /// Build from a key/value provider alone, falling back to defaults
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.url = settings.get_or(BROKER_URL_KEY, config.url)?;
        config.connect_timeout = settings.get_or(CONNECT_TIMEOUT_KEY, config.connect_timeout)?;
        config.reconnect_period = settings.get_or(RECONNECT_PERIOD_KEY, config.reconnect_period)?;
        Ok(config)
    }

    /// Override fields with the `MQTT_*` keys from the override layer of
    /// `settings`. Values only present in `default.env` are left alone.
    pub fn apply_settings(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(url) = settings.get_override(BROKER_URL_KEY)? {
            self.url = url;
        }
        if let Some(timeout) = settings.get_override(CONNECT_TIMEOUT_KEY)? {
            self.connect_timeout = timeout;
        }
        if let Some(period) = settings.get_override(RECONNECT_PERIOD_KEY)? {
            self.reconnect_period = period;
        }
        Ok(())
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    /// Get the reconnect period as Duration
    pub fn reconnect_period_duration(&self) -> Duration {
        Duration::from_millis(self.reconnect_period)
    }

    /// Get the keep-alive interval as Duration
    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    /// Get the acknowledgement timeout as Duration
    pub fn ack_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.ack_timeout)
    }

    /// Split the URL into host and port, dropping any scheme
    pub fn parse_endpoint(&self) -> (String, u16) {
        let address = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let address = address.trim_end_matches('/');

        if let Some((host, port_str)) = address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (address.to_string(), DEFAULT_PORT)
    }

    /// Validate the broker section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((scheme, _)) = self.url.split_once("://") {
            if !matches!(scheme, "mqtt" | "tcp") {
                return Err(ConfigError::Validation(format!(
                    "broker.url scheme '{}' is not supported (use mqtt:// or tcp://)",
                    scheme
                )));
            }
        }
        if self.parse_endpoint().0.is_empty() {
            return Err(ConfigError::Validation(
                "broker.url must include a host".to_string(),
            ));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".to_string(),
            ));
        }
        if self.qos > 2 {
            return Err(ConfigError::Validation(
                "broker.qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.keep_alive < 5 {
            return Err(ConfigError::Validation(
                "broker.keep_alive must be at least 5 seconds".to_string(),
            ));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.request_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
