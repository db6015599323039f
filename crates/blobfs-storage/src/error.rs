//! Error types for the storage collaborators.

use thiserror::Error;

use crate::block::{Extent, NodeHandle};

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not enough free blocks to satisfy a reservation.
    #[error("Out of space: requested {requested} blocks, {available} available")]
    OutOfSpace {
        /// Number of blocks requested.
        requested: u64,
        /// Number of free blocks at the time of the request.
        available: u64,
    },

    /// Not enough free metadata nodes to satisfy a reservation.
    #[error("Out of nodes: requested {requested} nodes, {available} available")]
    OutOfNodes {
        /// Number of nodes requested.
        requested: usize,
        /// Number of free nodes at the time of the request.
        available: usize,
    },

    /// An extent was returned to the allocator that it does not own in the expected state.
    #[error("Invalid extent {extent}: {reason}")]
    InvalidExtent {
        /// The offending extent.
        extent: Extent,
        /// Description of the problem.
        reason: &'static str,
    },

    /// A node handle is unknown or in the wrong state.
    #[error("Invalid node {node}: {reason}")]
    InvalidNode {
        /// The offending node.
        node: NodeHandle,
        /// Description of the problem.
        reason: &'static str,
    },

    /// A block range falls outside the device.
    #[error("Block range out of bounds: start {start}, count {count}, device has {block_count} blocks")]
    BlockOutOfRange {
        /// First block of the range.
        start: u64,
        /// Number of blocks in the range.
        count: u64,
        /// Total blocks on the device.
        block_count: u64,
    },

    /// Device-level failure.
    #[error("Device error: {reason}")]
    DeviceError {
        /// Description of the error.
        reason: String,
    },

    /// A write request named a buffer that is not attached.
    #[error("Buffer {buffer} is not attached")]
    UnknownBuffer {
        /// The buffer identifier.
        buffer: u64,
    },

    /// A write request reads past the end of its source buffer.
    #[error("Source range out of bounds: buffer {buffer}, offset {offset}, len {len}, buffer len {buffer_len}")]
    SourceOutOfRange {
        /// The buffer identifier.
        buffer: u64,
        /// Byte offset into the buffer.
        offset: u64,
        /// Length in bytes.
        len: u64,
        /// Size of the attached buffer.
        buffer_len: u64,
    },

    /// The metadata journal has no room for more entries.
    #[error("Journal full: {entries} entries pending")]
    JournalFull {
        /// Number of entries currently held.
        entries: usize,
    },
}
