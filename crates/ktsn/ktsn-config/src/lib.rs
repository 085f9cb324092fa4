//! TOML configuration for the sender daemon and the shim.
//!
//! Same `serde(Deserialize)` + `thiserror` + `toml::from_str` shape as
//! `onyx-config`/`obsidian-config`: a flat struct with `#[serde(default =
//! ...)]` per field so every key in `ktsnd.toml` is optional.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

/// `ktsnd.toml` — the sender daemon's configuration (§6.1).
#[derive(Deserialize, Debug, Clone)]
pub struct SenderConfig {
    #[serde(default = "defaults::data_memory_name")]
    pub data_memory_name: String,
    #[serde(default = "defaults::ctrl_memory_name")]
    pub ctrl_memory_name: String,
    #[serde(default = "defaults::data_memory_size")]
    pub data_memory_size: usize,
    #[serde(default = "defaults::ring_capacity")]
    pub ring_capacity: u32,
    #[serde(default = "defaults::tx_delta_ns")]
    pub tx_delta_ns: i64,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            data_memory_name: defaults::data_memory_name(),
            ctrl_memory_name: defaults::ctrl_memory_name(),
            data_memory_size: defaults::data_memory_size(),
            ring_capacity: defaults::ring_capacity(),
            tx_delta_ns: defaults::tx_delta_ns(),
            log_level: defaults::log_level(),
        }
    }
}

impl SenderConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

/// The subset of the sender's configuration the shim must agree on to find
/// the same arena: the two shared-memory object names. Read from
/// `KTSN_SHIM_CONFIG` if set, matching compiled-in defaults otherwise
/// (§6.1).
#[derive(Deserialize, Debug, Clone)]
pub struct ShimConfig {
    #[serde(default = "defaults::data_memory_name")]
    pub data_memory_name: String,
    #[serde(default = "defaults::ctrl_memory_name")]
    pub ctrl_memory_name: String,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            data_memory_name: defaults::data_memory_name(),
            ctrl_memory_name: defaults::ctrl_memory_name(),
        }
    }
}

impl ShimConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Reads `KTSN_SHIM_CONFIG` if set, falling back to compiled-in
    /// defaults if the variable is absent — the common case needs no file.
    pub fn from_env() -> Self {
        match std::env::var("KTSN_SHIM_CONFIG") {
            Ok(path) => match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::error!(%path, %err, "KTSN_SHIM_CONFIG set but unreadable, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

mod defaults {
    pub fn data_memory_name() -> String {
        ktsn_core::DATA_MEMORY_NAME.to_string()
    }

    pub fn ctrl_memory_name() -> String {
        ktsn_core::CTRL_MEMORY_NAME.to_string()
    }

    pub fn data_memory_size() -> usize {
        ktsn_core::DEFAULT_DATA_MEMORY_SIZE
    }

    pub fn ring_capacity() -> u32 {
        ktsn_core::DEFAULT_RING_CAPACITY as u32
    }

    pub fn tx_delta_ns() -> i64 {
        ktsn_core::DEFAULT_TX_DELTA_NS
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_every_default() {
        let cfg: SenderConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.data_memory_name, ktsn_core::DATA_MEMORY_NAME);
        assert_eq!(cfg.ring_capacity, ktsn_core::DEFAULT_RING_CAPACITY as u32);
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let toml_str = "tx_delta_ns = 10000\nlog_level = \"debug\"\n";
        let cfg: SenderConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.tx_delta_ns, 10_000);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ring_capacity, ktsn_core::DEFAULT_RING_CAPACITY as u32);
    }

    #[test]
    fn shim_config_defaults_match_the_sender() {
        let cfg = ShimConfig::default();
        assert_eq!(cfg.data_memory_name, ktsn_core::DATA_MEMORY_NAME);
        assert_eq!(cfg.ctrl_memory_name, ktsn_core::CTRL_MEMORY_NAME);
    }

    #[test]
    fn read_failure_is_a_distinct_error() {
        let err = SenderConfig::load("/nonexistent/ktsnd.toml".to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
