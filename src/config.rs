//! Bridge configuration.
//!
//! Loaded once from TOML at startup and treated as immutable afterwards.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::protocol::PROTOCOL_VERSION;
use crate::topic::{TopicScheme, DEFAULT_CONTROLLER_TOPIC, DEFAULT_MANUFACTURER, DEFAULT_PREFIX};
use crate::transport::QoS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub app: AppConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub clean_session: bool,
    pub publish_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    pub disconnect_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            client_id: "mqtt_robot_bridge".to_string(),
            username: String::new(),
            password: String::new(),
            qos: 1,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 60,
            max_reconnect_attempts: 10,
            clean_session: true,
            publish_timeout_secs: 5,
            subscribe_timeout_secs: 5,
            disconnect_grace_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub prefix: String,
    pub manufacturer: String,
    pub controller_topic: String,
    pub interface_version: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            controller_topic: DEFAULT_CONTROLLER_TOPIC.to_string(),
            interface_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Who is responsible for reconnecting after a live connection drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Leave it to the transport client's own reconnect loop.
    #[default]
    Transport,
    /// Run the same bounded retry used for the initial connect.
    Managed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(deserialize_with = "deserialize_serials")]
    pub target_robot_serials: Vec<String>,
    pub auto_init_on_connect: bool,
    pub auto_init_delay_secs: u64,
    pub auto_factsheet_request: bool,
    pub factsheet_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub status_interval_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub log_level: String,
    pub steady_state_reconnect: ReconnectPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_robot_serials: vec![
                "DEX0001".to_string(),
                "DEX0002".to_string(),
                "DEX0003".to_string(),
            ],
            auto_init_on_connect: true,
            auto_init_delay_secs: 2,
            auto_factsheet_request: true,
            factsheet_delay_ms: 1000,
            health_check_interval_secs: 10,
            status_interval_secs: 30,
            graceful_shutdown_secs: 10,
            log_level: "info".to_string(),
            steady_state_reconnect: ReconnectPolicy::Transport,
        }
    }
}

/// Split a delimited serial list on `,`, `;` or `|`, dropping empty entries.
pub fn parse_serial_list(raw: &str) -> Vec<String> {
    raw.split([',', ';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_serials<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Serials {
        List(Vec<String>),
        Delimited(String),
    }

    Ok(match Serials::deserialize(deserializer)? {
        Serials::List(list) => list
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Serials::Delimited(raw) => parse_serial_list(&raw),
    })
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.url must not be empty".into()));
        }
        if QoS::try_from(self.broker.qos).is_err() {
            return Err(ConfigError::Invalid(format!(
                "broker.qos must be 0, 1 or 2 (got {})",
                self.broker.qos
            )));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.broker.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_reconnect_attempts must be greater than zero".into(),
            ));
        }
        if self.topics.prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("topics.prefix must not be empty".into()));
        }
        if self.topics.manufacturer.is_empty() {
            return Err(ConfigError::Invalid("topics.manufacturer must not be empty".into()));
        }
        if self.topics.controller_topic.is_empty() {
            return Err(ConfigError::Invalid(
                "topics.controller_topic must not be empty".into(),
            ));
        }
        if self.app.target_robot_serials.is_empty() {
            return Err(ConfigError::Invalid(
                "app.target_robot_serials must list at least one robot".into(),
            ));
        }
        if self.app.status_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "app.status_interval_secs must be greater than zero".into(),
            ));
        }
        if self.app.health_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "app.health_check_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(
            &self.topics.prefix,
            &self.topics.manufacturer,
            &self.topics.controller_topic,
        )
    }

    pub fn qos(&self) -> QoS {
        QoS::try_from(self.broker.qos).unwrap_or(QoS::AtLeastOnce)
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl AppConfig {
    pub fn auto_init_delay(&self) -> Duration {
        Duration::from_secs(self.auto_init_delay_secs)
    }

    pub fn factsheet_delay(&self) -> Duration {
        Duration::from_millis(self.factsheet_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }
}
