#![warn(missing_docs)]

//! blobfs storage collaborators: extent allocator, block device, metadata journal writeback
//!
//! This crate provides the services the blob core consumes but does not
//! own: reserving and freeing block extents and metadata nodes, raw block
//! I/O, and transactional writeback of data runs and node records.

pub mod allocator;
pub mod block;
pub mod device;
pub mod error;
pub mod journal;

pub use allocator::{Allocator, AllocatorConfig, AllocatorStats, ExtentAllocator};
pub use block::{blocks_for_bytes, total_blocks, Extent, NodeHandle, DEFAULT_BLOCK_SIZE};
pub use device::{BlockDevice, DeviceConfig, IoStats, MemBlockDevice};
pub use error::{StorageError, StorageResult};
pub use journal::{
    BufferId, JournalConfig, JournalEntry, JournalOp, JournalStats, JournalWriteback,
    TransactionTag, WriteRequest, Writeback, WritebackOp,
};
