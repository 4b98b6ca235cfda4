//! Connection pool configuration
//!
//! Network parameters and timing knobs, loadable from a JSON file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default network magic number
pub const DEFAULT_MAGIC: u32 = 0x5045_4552; // "PEER"

/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8333";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Scheduling parameters of the pool's background tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTimings {
    /// Delay before the first reconnect sweep
    pub reconnect_delay_ms: u64,
    /// Period between reconnect sweeps
    pub reconnect_period_ms: u64,
    /// Pause between two receive passes
    pub receive_idle_ms: u64,
    /// How long the pump waits on one idle peer before moving on
    pub receive_timeout_ms: u64,
    /// How long a connect attempt waits for the handshake answer
    pub handshake_timeout_ms: u64,
    /// Limit for a single send to, or close of, one peer
    pub send_timeout_ms: u64,
    /// Capacity of the received-message subscription buffer
    pub message_buffer: usize,
}

impl Default for PoolTimings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 100,
            reconnect_period_ms: 20_000,
            receive_idle_ms: 500,
            receive_timeout_ms: 250,
            handshake_timeout_ms: 5_000,
            send_timeout_ms: 5_000,
            message_buffer: 256,
        }
    }
}

impl PoolTimings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Never zero, tokio intervals reject an empty period
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms.max(1))
    }

    pub fn receive_idle(&self) -> Duration {
        Duration::from_millis(self.receive_idle_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Full pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Network magic number exchanged in the handshake
    pub magic: u32,
    /// Address the inbound listener binds to
    pub listen_address: String,
    /// Well-known peers to dial
    pub seeds: Vec<String>,
    /// User agent advertised to peers
    pub user_agent: String,
    pub timings: PoolTimings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            magic: DEFAULT_MAGIC,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            seeds: Vec::new(),
            user_agent: format!("peer-pool/{}", env!("CARGO_PKG_VERSION")),
            timings: PoolTimings::default(),
        }
    }
}

impl PoolConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = fs::File::open(path.as_ref())?;
        let config: PoolConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        log::info!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_address is empty".into()));
        }
        if self.timings.reconnect_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_period_ms must be positive".into(),
            ));
        }
        if self.timings.receive_timeout_ms == 0
            || self.timings.handshake_timeout_ms == 0
            || self.timings.send_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.timings.message_buffer == 0 {
            return Err(ConfigError::Invalid("message_buffer must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");

        let config = PoolConfig {
            magic: 7,
            listen_address: "127.0.0.1:9000".to_string(),
            seeds: vec!["10.0.0.1:9000".to_string()],
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PoolConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        fs::write(&path, r#"{ "magic": 3, "timings": { "reconnect_period_ms": 1000 } }"#).unwrap();

        let loaded = PoolConfig::load(&path).unwrap();
        assert_eq!(loaded.magic, 3);
        assert_eq!(loaded.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert_eq!(loaded.timings.reconnect_period(), Duration::from_secs(1));
        assert_eq!(loaded.timings.receive_idle_ms, 500);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PoolConfig::default();
        config.timings.reconnect_period_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = PoolConfig {
            listen_address: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_period_is_clamped() {
        let timings = PoolTimings {
            reconnect_period_ms: 0,
            ..Default::default()
        };
        assert_eq!(timings.reconnect_period(), Duration::from_millis(1));

        let mut config = PoolConfig::default();
        config.timings.send_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = PoolConfig::load(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }
}
