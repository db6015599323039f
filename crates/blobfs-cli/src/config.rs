use anyhow::Result;
use blobfs_core::BlobStoreConfig;
use blobfs_storage::{AllocatorConfig, DeviceConfig, JournalConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration of the in-memory store the CLI drives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: BlobStoreConfig,
    pub allocator: AllocatorConfig,
    pub journal: JournalConfig,
}

impl CliConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CliConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.store.validate()?;
        Ok(config)
    }

    /// Device sized to the allocator, with the store's block size.
    pub fn device(&self) -> DeviceConfig {
        DeviceConfig {
            block_size: self.store.block_size,
            block_count: self.allocator.total_blocks,
        }
    }
}
