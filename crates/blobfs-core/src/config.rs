//! Blob store configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::error::{BlobError, BlobResult};
use crate::merkle::NODE_SIZE;

/// Tunables of a [`crate::BlobStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Device block size in bytes; must match the writeback subsystem.
    pub block_size: u64,
    /// Algorithm tried for blobs large enough to benefit.
    pub compression: CompressionAlgorithm,
    /// Compressed output is kept only if it saves at least this many bytes.
    pub min_savings_threshold: u64,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            compression: CompressionAlgorithm::default(),
            min_savings_threshold: 4096,
        }
    }
}

impl BlobStoreConfig {
    /// Checks that the values can be used together.
    pub fn validate(&self) -> BlobResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(BlobError::Config(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        // Merkle levels are padded to whole nodes, which must tile blocks.
        if (NODE_SIZE as u64) % self.block_size != 0 {
            return Err(BlobError::Config(format!(
                "block_size {} does not divide the merkle node size {}",
                self.block_size, NODE_SIZE
            )));
        }
        if let CompressionAlgorithm::Zstd { level } = self.compression {
            if !(1..=22).contains(&level) {
                return Err(BlobError::Config(format!(
                    "zstd level {} outside 1..=22",
                    level
                )));
            }
        }
        Ok(())
    }

    /// Loads a TOML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> BlobResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BlobError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: BlobStoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| BlobError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| BlobError::Config(e.to_string()))?
            }
            _ => {
                return Err(BlobError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }
}
