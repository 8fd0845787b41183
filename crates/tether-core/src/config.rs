use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// How [`MessageExchange`](crate::exchange::MessageExchange) routes a send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Live channel when connected, durable store otherwise.
    #[default]
    PreferLive,
    StoreOnly,
    /// Store always; additionally live when connected, under the same id.
    LiveAndStore,
}

impl FromStr for DeliveryPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "prefer_live" => Ok(DeliveryPolicy::PreferLive),
            "store_only" => Ok(DeliveryPolicy::StoreOnly),
            "live_and_store" => Ok(DeliveryPolicy::LiveAndStore),
            other => Err(ConfigError::InvalidValue {
                key: "delivery_policy".into(),
                value: other.into(),
            }),
        }
    }
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryPolicy::PreferLive => "prefer_live",
            DeliveryPolicy::StoreOnly => "store_only",
            DeliveryPolicy::LiveAndStore => "live_and_store",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub open_timeout_secs: u64,
    pub delivery_policy: DeliveryPolicy,
    /// Upper bound on messages returned by a history query.
    pub history_limit: usize,
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub event_capacity: usize,
    /// Live message ids remembered for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: 30,
            delivery_policy: DeliveryPolicy::PreferLive,
            history_limit: 100,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            data_channel_label: "chat".to_string(),
            event_capacity: 256,
            dedup_window: 1024,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TETHER_OPEN_TIMEOUT_SECS") {
            config.open_timeout_secs = parse_var("TETHER_OPEN_TIMEOUT_SECS", v)?;
        }

        if let Ok(v) = std::env::var("TETHER_DELIVERY_POLICY") {
            config.delivery_policy = v.parse()?;
        }

        if let Ok(v) = std::env::var("TETHER_HISTORY_LIMIT") {
            config.history_limit = parse_var("TETHER_HISTORY_LIMIT", v)?;
        }

        if let Ok(v) = std::env::var("TETHER_ICE_SERVERS") {
            config.ice_servers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(v) = std::env::var("TETHER_DATA_CHANNEL_LABEL") {
            config.data_channel_label = v;
        }

        if let Ok(v) = std::env::var("TETHER_EVENT_CAPACITY") {
            config.event_capacity = parse_var("TETHER_EVENT_CAPACITY", v)?;
        }

        if let Ok(v) = std::env::var("TETHER_DEDUP_WINDOW") {
            config.dedup_window = parse_var("TETHER_DEDUP_WINDOW", v)?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.open_timeout_secs == 0 {
            return Err(ConfigError::Invalid("open_timeout_secs must be > 0".into()));
        }

        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be > 0".into()));
        }

        if self.data_channel_label.is_empty() {
            return Err(ConfigError::Invalid("data_channel_label must not be empty".into()));
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be > 0".into()));
        }

        Ok(())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            ice_servers: self.ice_servers.clone(),
            channel_label: self.data_channel_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.data_channel_label, "chat");
        assert_eq!(config.delivery_policy, DeliveryPolicy::PreferLive);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            open_timeout_secs = 5
            delivery_policy = "live_and_store"
            "#,
        )
        .unwrap();
        assert_eq!(config.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.delivery_policy, DeliveryPolicy::LiveAndStore);
        assert_eq!(config.history_limit, 100);
    }

    #[test]
    fn test_bad_toml() {
        let err = CoreConfig::from_toml_str("history_limit = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = CoreConfig {
            open_timeout_secs: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("store_only".parse::<DeliveryPolicy>().unwrap(), DeliveryPolicy::StoreOnly);
        assert!("sometimes".parse::<DeliveryPolicy>().is_err());
        assert_eq!(DeliveryPolicy::LiveAndStore.to_string(), "live_and_store");
    }
}
