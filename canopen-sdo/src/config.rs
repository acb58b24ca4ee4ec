use serde::{Deserialize, Serialize};

use crate::error::SdoError;
use crate::frame::MAX_BLOCK_SIZE;

/// Tunables of the SDO engines.
///
/// Deserializes from a partial table, missing fields take their defaults:
///
/// ```toml
/// block_threshold = 32
/// block_size = 16
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdoConfig {
    /// Number of server channels. Channel 0 is the default SDO server.
    pub server_channels: u8,
    pub client_channels: u8,
    /// Transfers of at least this many bytes use block mode when allowed.
    pub block_threshold: usize,
    /// Block size proposed by a client and granted by a server.
    pub block_size: u8,
    /// Request (client) or accept (server) the end-to-end block CRC.
    pub block_crc: bool,
    /// Segments between two domain chunk indications.
    pub domain_chunk_segments: u16,
    /// Per-step timeout of server transfers, 0 disables it.
    pub server_timeout_ms: u32,
    pub default_timeout_ms: u32,
    pub queue_capacity: usize,
    /// Block streaming pauses while the transmit buffer is fuller than this.
    pub tx_pressure_percent: u8,
}

impl Default for SdoConfig {
    fn default() -> Self {
        Self {
            server_channels: 1,
            client_channels: 1,
            block_threshold: 64,
            block_size: MAX_BLOCK_SIZE,
            block_crc: true,
            domain_chunk_segments: 2,
            server_timeout_ms: 1000,
            default_timeout_ms: 1000,
            queue_capacity: 8,
            tx_pressure_percent: 80,
        }
    }
}

impl SdoConfig {
    pub fn validate(&self) -> Result<(), SdoError> {
        if self.server_channels == 0 {
            return Err(SdoError::Config("at least one server channel is required".to_string()));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(SdoError::Config(format!(
                "block size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.block_threshold <= crate::frame::EXPEDITED_MAX_LEN {
            return Err(SdoError::Config(format!(
                "block threshold {} must exceed the expedited size",
                self.block_threshold
            )));
        }
        if self.domain_chunk_segments == 0 {
            return Err(SdoError::Config("domain chunk needs at least one segment".to_string()));
        }
        if self.default_timeout_ms == 0 {
            return Err(SdoError::Config("default timeout must not be zero".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(SdoError::Config("queue capacity must not be zero".to_string()));
        }
        if self.tx_pressure_percent > 100 {
            return Err(SdoError::Config(format!(
                "transmit pressure {}% above 100%",
                self.tx_pressure_percent
            )));
        }
        Ok(())
    }

    /// Bytes per domain chunk.
    pub fn domain_chunk_len(&self) -> usize {
        self.domain_chunk_segments as usize * crate::frame::SEGMENT_DATA_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SdoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.domain_chunk_len(), 14);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: SdoConfig = toml::from_str("block_size = 5\nblock_crc = false").unwrap();
        assert_eq!(config.block_size, 5);
        assert!(!config.block_crc);
        assert_eq!(config.block_threshold, 64);
    }

    #[test]
    fn rejects_bad_block_size() {
        let config = SdoConfig { block_size: 128, ..Default::default() };
        assert!(matches!(config.validate(), Err(SdoError::Config(_))));
        let config = SdoConfig { block_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_threshold_inside_expedited_range() {
        let config = SdoConfig { block_threshold: 4, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
