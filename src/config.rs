//! Load-or-create-default configuration (`SPEC_FULL.md` §4.7). Shape kept
//! from the teacher's `src/config.rs` almost unchanged: a `Config` struct
//! with nested sections, a `Default` impl, a `validate()` pass returning a
//! descriptive `ConfigError::Validation`, and a `handle()` entry point that
//! writes the default file on first run. The Minecraft-specific
//! `ServerConfig` is replaced with the transport's own tunables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Sync timer period, microseconds (`synInterval`, §4.5).
    pub syn_interval_us: u64,
    /// Floor under the adaptive NAK interval (§4.5 "nextACK"/nakInterval).
    pub min_nak_interval_us: u64,
    /// Ceiling on any single packet, including header (§4.1).
    pub mtu: usize,
    /// Receive buffer size advertised in full ACKs. `-1` means "unbounded",
    /// matching the sentinel `CONNECTION_RECEIVE_BUFFER_SIZE_PACKETS` (§1
    /// non-goals: no flow-control back-pressure is enforced by this core).
    pub flow_window_packets: i32,
    /// Selects the `CongestionControl` implementation a `Socket` hands to
    /// each new `Connection`. Only `"aimd"` exists today; unknown values
    /// fail validation rather than silently falling back.
    pub congestion_control: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9001".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            syn_interval_us: 10_000,
            min_nak_interval_us: 20_000,
            mtu: crate::packet::MAX_PACKET_SIZE,
            flow_window_packets: crate::packet::CONNECTION_RECEIVE_BUFFER_SIZE_PACKETS,
            congestion_control: "aimd".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if SocketAddr::from_str(&self.network.bind_address).is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid bind address format: '{}'. Expected format like 'IP:PORT'.",
                self.network.bind_address
            )));
        }

        if self.transport.syn_interval_us == 0 {
            return Err(ConfigError::Validation(
                "syn_interval_us must be greater than 0.".to_string(),
            ));
        }

        if self.transport.min_nak_interval_us == 0 {
            return Err(ConfigError::Validation(
                "min_nak_interval_us must be greater than 0.".to_string(),
            ));
        }

        if self.transport.mtu == 0 || self.transport.mtu > crate::packet::MAX_PACKET_SIZE {
            return Err(ConfigError::Validation(format!(
                "mtu must be between 1 and {} bytes.",
                crate::packet::MAX_PACKET_SIZE
            )));
        }

        if self.transport.congestion_control != "aimd" {
            return Err(ConfigError::Validation(format!(
                "unknown congestion_control '{}': only 'aimd' is available.",
                self.transport.congestion_control
            )));
        }

        Ok(())
    }
}

pub fn handle() -> Result<Config> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<()> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_unparsable_bind_address() {
        let mut config = Config::default();
        config.network.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_syn_interval() {
        let mut config = Config::default();
        config.transport.syn_interval_us = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_mtu_above_max_packet_size() {
        let mut config = Config::default();
        config.transport.mtu = crate::packet::MAX_PACKET_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_congestion_control() {
        let mut config = Config::default();
        config.transport.congestion_control = "bbr".to_string();
        assert!(config.validate().is_err());
    }
}
