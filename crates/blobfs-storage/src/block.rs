//! Core block, extent and node types shared by the allocator, device and journal.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Default device block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// A contiguous run of device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    /// First device block of the run.
    pub start: u64,
    /// Number of blocks in the run.
    pub length: u64,
}

impl Extent {
    /// Creates a new extent.
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// One past the last block of the run.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Returns true if the extent covers no blocks.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns true if the two extents share at least one block.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Opaque handle to a slot in the metadata node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(pub u32);

impl NodeHandle {
    /// Returns the slot index.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Number of blocks needed to hold `bytes` bytes.
pub fn blocks_for_bytes(bytes: u64, block_size: u64) -> u64 {
    bytes.div_ceil(block_size)
}

/// Total blocks covered by a list of extents.
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}
