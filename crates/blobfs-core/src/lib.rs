#![warn(missing_docs)]

//! blobfs core: content-addressed immutable blobs with Merkle verification and compression
//!
//! A blob is named by the Merkle root of its content. It is written once,
//! checked against its name, optionally compressed (LZ4/Zstd), streamed to
//! reserved extents through the writeback subsystem, and served read-only
//! afterwards, including zero-copy clones of its in-memory mapping.

pub mod blob;
pub mod clone_tracker;
pub mod compression;
pub mod config;
pub mod digest;
pub mod error;
pub mod extent_stream;
pub mod inode;
pub mod merkle;
pub mod store;
pub mod write_state;

pub use blob::{Blob, BlobContext, BlobState};
pub use clone_tracker::{BlobClone, CloneLease, CloneRights, CloneTracker};
pub use compression::{decompress, Codec, CompressionAlgorithm, CompressionError, Compressor};
pub use config::BlobStoreConfig;
pub use digest::{Digest, ParseDigestError, DIGEST_LEN};
pub use error::{BlobError, BlobResult};
pub use extent_stream::{ExtentStream, IoRun};
pub use inode::{nodes_for_extents, CompressionFlag, InodeRecord, NodeRecord};
pub use merkle::{root_of, tree_len, MerkleTree, VerifyError, NODE_SIZE};
pub use store::{BlobStore, BlobStoreStats, HandleId, HandleKind};
pub use write_state::BlobWriteState;
