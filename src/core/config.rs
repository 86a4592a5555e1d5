//! Table configuration
//!
//! ```toml
//! block_size = 512
//! max_lanes = 8
//! nfree = 256
//! ```

use crate::error::{BttError, Result};
use crate::layout::{DEFAULT_NFREE, MAP_ENTRY_LBA_MASK};
use serde::{Deserialize, Serialize};

/// Parameters for opening a BTT table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BttConfig {
    /// External block size in bytes
    pub block_size: u32,

    /// Upper bound on the lane count, 0 for no bound beyond nfree
    pub max_lanes: u32,

    /// Free blocks per arena when a new layout is written
    pub nfree: u32,
}

impl Default for BttConfig {
    fn default() -> Self {
        BttConfig {
            block_size: 4096,
            max_lanes: 0,
            nfree: DEFAULT_NFREE,
        }
    }
}

impl BttConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: BttConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| BttError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(BttError::Config("block_size must be non-zero".into()));
        }
        if self.nfree == 0 || self.nfree > MAP_ENTRY_LBA_MASK {
            return Err(BttError::Config(format!(
                "nfree must be between 1 and {}, got {}",
                MAP_ENTRY_LBA_MASK, self.nfree
            )));
        }
        Ok(())
    }
}
