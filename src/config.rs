use crate::models::TransportScheme;
use dotenvy::dotenv;
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("Settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Settings serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Topics the console talks to the device on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub detection_data: String,
    pub config_update: String,
    pub config: String,
}

impl Topics {
    pub fn with_root(root: &str) -> Self {
        let prepend_root_topic = |topic: &str| {
            if !root.is_empty() {
                format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
            } else {
                topic.to_string()
            }
        };

        Self {
            detection_data: prepend_root_topic("detection_data"),
            config_update: prepend_root_topic("config_update"),
            config: prepend_root_topic("config"),
        }
    }

    /// Topics subscribed automatically whenever the session connects.
    pub fn defaults(&self) -> [&str; 2] {
        [self.detection_data.as_str(), self.config_update.as_str()]
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::with_root(DEFAULT_TOPIC_ROOT)
    }
}

const DEFAULT_TOPIC_ROOT: &str = "/ESP32";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub topics: Topics,
    pub mqtt_keep_alive_secs: u64,
    /// 0 leaves reconnection to the operator.
    pub mqtt_max_retries: usize,
    pub mqtt_retry_interval_ms: u64,
    /// Connect with the saved settings at startup instead of waiting for `connect`.
    pub auto_connect: bool,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if !(5..=3600).contains(&self.mqtt_keep_alive_secs) {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEP_ALIVE_SECS must be between 5 and 3600".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let topic_root = env::var("MQTT_TOPIC_ROOT").unwrap_or_else(|_| DEFAULT_TOPIC_ROOT.to_string());
        // Publishing is impossible on a wildcard topic.
        if topic_root.contains(['#', '+']) {
            return Err(ConfigError::MissingOrInvalid("MQTT_TOPIC_ROOT".to_string()));
        }

        let config = Self {
            db_path: env::var("THERMAL_DB_PATH")
                .unwrap_or_else(|_| "fire_records.db".to_string())
                .into(),
            settings_path: env::var("THERMAL_SETTINGS_PATH")
                .unwrap_or_else(|_| "config.json".to_string())
                .into(),
            topics: Topics::with_root(&topic_root),
            mqtt_keep_alive_secs: parse_var("MQTT_KEEP_ALIVE_SECS", "60")?,
            mqtt_max_retries: parse_var("MQTT_MAX_RETRIES", "0")?,
            mqtt_retry_interval_ms: parse_var("MQTT_RETRY_INTERVAL_MS", "1000")?,
            auto_connect: parse_var("MQTT_AUTO_CONNECT", "false")?,
        };

        config.validate()?;

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{name} has an invalid value")))
}

/// Broker connection parameters remembered between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub transport: TransportScheme,
    pub host: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transport: TransportScheme::Plain,
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("thermal_console_{}", Uuid::new_v4().simple()),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ConnectionSettings {
    /// Loads settings, falling back to defaults when the file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Using default connection settings ({}): {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        info!("Connection settings saved to {}", path.display());
        Ok(())
    }
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{text}'"))),
    }
}
