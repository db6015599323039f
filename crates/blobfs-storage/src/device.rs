//! Block device abstraction.
//!
//! Provides the trait-based abstraction ([`BlockDevice`]) used by the
//! writeback layer for raw block I/O, and an in-memory implementation for
//! tests and tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::error::{StorageError, StorageResult};

/// Geometry of a block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Block size in bytes.
    pub block_size: u64,
    /// Number of blocks on the device.
    pub block_count: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: 65536,
        }
    }
}

/// Device I/O statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Total read operations completed
    pub reads_completed: u64,
    /// Total write operations completed
    pub writes_completed: u64,
    /// Total flush operations completed
    pub flushes_completed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total errors encountered
    pub errors: u64,
}

/// Trait for raw block I/O.
/// Implementations can be a real device or in-memory for testing.
pub trait BlockDevice: Send + Sync {
    /// Block size in bytes.
    fn block_size(&self) -> u64;

    /// Number of blocks on the device.
    fn block_count(&self) -> u64;

    /// Reads `count` blocks starting at `start`.
    fn read_blocks(
        &self,
        start: u64,
        count: u64,
    ) -> impl std::future::Future<Output = StorageResult<Vec<u8>>> + Send;

    /// Writes whole blocks starting at `start`.
    /// The data length must be a multiple of the block size.
    fn write_blocks(
        &self,
        start: u64,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    /// Flush all pending writes to persistent storage.
    fn flush(&self) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    /// Get current I/O statistics.
    fn stats(&self) -> IoStats;
}

/// Sparse in-memory block device.
/// Unwritten blocks read back as zeros.
pub struct MemBlockDevice {
    config: DeviceConfig,
    blocks: AsyncMutex<HashMap<u64, Vec<u8>>>,
    stats: Mutex<IoStats>,
    fail_writes: AtomicBool,
}

impl MemBlockDevice {
    /// Create a new in-memory device.
    pub fn new(config: DeviceConfig) -> Self {
        debug!(
            block_size = config.block_size,
            block_count = config.block_count,
            "creating in-memory block device"
        );
        Self {
            config,
            blocks: AsyncMutex::new(HashMap::new()),
            stats: Mutex::new(IoStats::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flips every bit of one byte of a stored block. Test hook.
    pub async fn corrupt_block(&self, block: u64, byte: usize) {
        let mut blocks = self.blocks.lock().await;
        let block_size = self.config.block_size as usize;
        let data = blocks
            .entry(block)
            .or_insert_with(|| vec![0u8; block_size]);
        if let Some(b) = data.get_mut(byte % block_size) {
            *b ^= 0xFF;
        }
    }

    fn check_range(&self, start: u64, count: u64) -> StorageResult<()> {
        if start
            .checked_add(count)
            .map_or(true, |end| end > self.config.block_count)
        {
            return Err(StorageError::BlockOutOfRange {
                start,
                count,
                block_count: self.config.block_count,
            });
        }
        Ok(())
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut IoStats),
    {
        f(&mut self.stats.lock());
    }
}

impl Default for MemBlockDevice {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> u64 {
        self.config.block_size
    }

    fn block_count(&self) -> u64 {
        self.config.block_count
    }

    async fn read_blocks(&self, start: u64, count: u64) -> StorageResult<Vec<u8>> {
        if let Err(e) = self.check_range(start, count) {
            self.update_stats(|s| s.errors += 1);
            return Err(e);
        }
        let block_size = self.config.block_size as usize;
        let mut out = vec![0u8; count as usize * block_size];

        let blocks = self.blocks.lock().await;
        for i in 0..count {
            if let Some(data) = blocks.get(&(start + i)) {
                let at = i as usize * block_size;
                out[at..at + block_size].copy_from_slice(data);
            }
        }
        drop(blocks);

        debug!(start = start, count = count, "device read");
        self.update_stats(|s| {
            s.reads_completed += 1;
            s.bytes_read += out.len() as u64;
        });
        Ok(out)
    }

    async fn write_blocks(&self, start: u64, data: Vec<u8>) -> StorageResult<()> {
        let block_size = self.config.block_size as usize;
        if self.fail_writes.load(Ordering::SeqCst) {
            self.update_stats(|s| s.errors += 1);
            return Err(StorageError::DeviceError {
                reason: format!("injected write failure at block {}", start),
            });
        }
        if data.len() % block_size != 0 {
            self.update_stats(|s| s.errors += 1);
            return Err(StorageError::DeviceError {
                reason: format!(
                    "write of {} bytes is not a multiple of the {} byte block size",
                    data.len(),
                    block_size
                ),
            });
        }
        let count = (data.len() / block_size) as u64;
        if let Err(e) = self.check_range(start, count) {
            self.update_stats(|s| s.errors += 1);
            return Err(e);
        }

        let mut blocks = self.blocks.lock().await;
        for (i, chunk) in data.chunks(block_size).enumerate() {
            blocks.insert(start + i as u64, chunk.to_vec());
        }
        drop(blocks);

        debug!(start = start, count = count, "device write");
        self.update_stats(|s| {
            s.writes_completed += 1;
            s.bytes_written += data.len() as u64;
        });
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        debug!("device flush");
        self.update_stats(|s| s.flushes_completed += 1);
        Ok(())
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}
