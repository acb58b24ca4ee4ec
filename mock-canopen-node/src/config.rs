use std::fs;
use std::path::Path;

use canopen_sdo::{SdoConfig, SdoError};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("node id {0} outside 1..=127")]
    NodeId(u8),
    #[error(transparent)]
    Sdo(#[from] SdoError),
}

/// Settings of the mock node, read from a TOML file:
///
/// ```toml
/// interface = "vcan0"
/// node_id = 4
/// log_level = "debug"
///
/// [sdo]
/// block_size = 32
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub interface: String,
    pub node_id: u8,
    /// One of off, error, warn, info, debug, trace.
    pub log_level: String,
    pub sdo: SdoConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interface: "vcan0".to_string(),
            node_id: 4,
            log_level: "info".to_string(),
            sdo: SdoConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 || self.node_id > 127 {
            return Err(ConfigError::NodeId(self.node_id));
        }
        self.sdo.validate()?;
        Ok(())
    }

    /// Unknown level names fall back to info.
    pub fn log_level(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }

    /// Apply `--interface` and `--node-id` from the command line.
    pub fn apply_args(&mut self, args: &[String]) {
        let mut i = 0;
        while i + 1 < args.len() {
            match args[i].as_str() {
                "--interface" => self.interface = args[i + 1].clone(),
                "--node-id" => {
                    if let Ok(node_id) = args[i + 1].parse() {
                        self.node_id = node_id;
                    }
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
    }
}

/// Value following `--config`, if any.
pub fn config_path(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = NodeConfig::parse(
            r#"
            node_id = 9
            log_level = "debug"

            [sdo]
            block_size = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, 9);
        assert_eq!(config.interface, "vcan0");
        assert_eq!(config.log_level(), LevelFilter::Debug);
        assert_eq!(config.sdo.block_size, 32);
        assert_eq!(config.sdo.block_threshold, SdoConfig::default().block_threshold);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(NodeConfig::parse("node_id = 0"), Err(ConfigError::NodeId(0))));
        assert!(matches!(NodeConfig::parse("[sdo]\nblock_size = 0"), Err(ConfigError::Sdo(_))));
        assert!(matches!(NodeConfig::parse("node_id = \"four\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn command_line_overrides() {
        let args: Vec<String> = ["mock-node", "--config", "node.toml", "--interface", "can1", "--node-id", "12"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut config = NodeConfig::default();
        config.apply_args(&args);
        assert_eq!(config_path(&args), Some("node.toml"));
        assert_eq!(config.interface, "can1");
        assert_eq!(config.node_id, 12);
    }
}
