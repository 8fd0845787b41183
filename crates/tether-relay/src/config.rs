use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,

    // Mailbox settings
    pub max_signal_size: usize,
    pub max_mailbox_len: usize,
    pub signal_ttl_secs: u64,
    pub eviction_interval_secs: u64,
    pub idle_mailbox_timeout_secs: u64,

    // Long polling
    pub max_wait_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_signal_size: 16 * 1024, // 16KB
            max_mailbox_len: 256,
            signal_ttl_secs: 300, // 5 minutes
            eviction_interval_secs: 30,
            idle_mailbox_timeout_secs: 3600, // 1 hour
            max_wait_ms: 60_000,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TETHER_RELAY_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }

        if let Ok(size) = std::env::var("TETHER_RELAY_MAX_SIGNAL_SIZE") {
            config.max_signal_size = size.parse()?;
        }

        if let Ok(len) = std::env::var("TETHER_RELAY_MAX_MAILBOX_LEN") {
            config.max_mailbox_len = len.parse()?;
        }

        if let Ok(ttl) = std::env::var("TETHER_RELAY_SIGNAL_TTL_SECS") {
            config.signal_ttl_secs = ttl.parse()?;
        }

        if let Ok(interval) = std::env::var("TETHER_RELAY_EVICTION_INTERVAL_SECS") {
            config.eviction_interval_secs = interval.parse()?;
        }

        if let Ok(wait) = std::env::var("TETHER_RELAY_MAX_WAIT_MS") {
            config.max_wait_ms = wait.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_signal_size == 0 {
            anyhow::bail!("max_signal_size must be > 0");
        }

        if self.max_mailbox_len == 0 {
            anyhow::bail!("max_mailbox_len must be > 0");
        }

        if self.signal_ttl_secs == 0 {
            anyhow::bail!("signal_ttl_secs must be > 0");
        }

        if self.eviction_interval_secs == 0 {
            anyhow::bail!("eviction_interval_secs must be > 0");
        }

        Ok(())
    }

    pub fn signal_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn idle_mailbox_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_mailbox_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config: RelayConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:9000"
            max_mailbox_len = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_mailbox_len, 8);
        assert_eq!(config.signal_ttl_secs, 300);
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = RelayConfig {
            signal_ttl_secs: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
