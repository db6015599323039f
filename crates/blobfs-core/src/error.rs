//! Error types for the blob core.

use blobfs_storage::StorageError;
use thiserror::Error;

use crate::blob::BlobState;
use crate::digest::Digest;
use crate::merkle::VerifyError;

/// Result type alias for blob operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Error variants for blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// The allocator could not reserve blocks or nodes.
    #[error("Allocation failed: {0}")]
    Alloc(#[source] StorageError),

    /// The writeback subsystem rejected or failed a transaction.
    #[error("Write failed: {0}")]
    Write(#[source] StorageError),

    /// Stored blocks or records could not be read back.
    #[error("Read failed: {0}")]
    Read(#[source] StorageError),

    /// Content does not match its name, or stored data failed to decode.
    #[error("Data integrity failure for {digest}: {reason}")]
    DataIntegrity {
        /// The blob concerned.
        digest: Digest,
        /// What was detected.
        reason: String,
    },

    /// An explicit verification failed.
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// A shareable region could not be handed out.
    #[error("Clone refused: {reason}")]
    Clone {
        /// Why the clone was refused.
        reason: &'static str,
    },

    /// The operation is not valid in the blob's current state.
    #[error("Operation {op} not permitted in state {state:?}")]
    BadState {
        /// The rejected operation.
        op: &'static str,
        /// The state the blob was in.
        state: BlobState,
    },

    /// A blob with this digest is already present.
    #[error("Blob {0} already exists")]
    AlreadyExists(Digest),

    /// No blob with this digest is present.
    #[error("Blob {0} not found")]
    NotFound(Digest),

    /// A handle was used after close or was never issued.
    #[error("Invalid handle {0}")]
    InvalidHandle(u64),

    /// Configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored node record could not be decoded.
    #[error("Corrupt node record: {0}")]
    CorruptRecord(String),
}

impl BlobError {
    /// True for failures that mean stored content cannot be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, BlobError::DataIntegrity { .. } | BlobError::Verify(_))
    }
}
