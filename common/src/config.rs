use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

/// Top-level configuration for the replay server, loaded from a TOML file
/// given on the CLI via `--config-path`.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ReplayServerConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Tables to install at startup. Empty means the server starts with no
    /// tables and relies entirely on checkpoint restore.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,

    #[serde(default = "default::table_max_size")]
    pub max_size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum size, in bytes, of a single sample-stream response frame.
    #[serde(default = "default::max_sample_response_bytes")]
    pub max_sample_response_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Number of most-recent checkpoints to retain when saving.
    #[serde(default = "default::checkpoint_keep")]
    pub keep: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl ReplayServerConfig {
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| {
            ReplayError::Internal(format!(
                "failed to open config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ReplayServerConfig = toml::from_str(&config_str)
            .map_err(|e| ReplayError::Internal(format!("failed to parse config: {}", e)))?;
        Ok(config)
    }
}

mod default {
    pub fn max_sample_response_bytes() -> u64 {
        40 * 1024 * 1024
    }

    pub fn checkpoint_keep() -> u32 {
        1
    }

    pub fn table_max_size() -> u64 {
        u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let cfg = ReplayServerConfig::default();
        assert_eq!(
            cfg.server.max_sample_response_bytes,
            default::max_sample_response_bytes()
        );
        assert_eq!(cfg.checkpoint.keep, default::checkpoint_keep());
    }

    #[test]
    fn test_partial_toml() {
        let toml_str = r#"
            [server]
            max_sample_response_bytes = 1024

            [checkpoint]
        "#;
        let cfg: ReplayServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.max_sample_response_bytes, 1024);
        assert_eq!(cfg.checkpoint.keep, default::checkpoint_keep());
    }
}
