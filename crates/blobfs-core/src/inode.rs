//! Metadata records stored in the node table.
//!
//! A blob's metadata is a chain of nodes. The first node is an inode: the
//! [`InodeRecord`] plus up to [`INLINE_EXTENTS`] extents. Further extents
//! spill into extent containers of up to [`CONTAINER_EXTENTS`] each, linked
//! in both directions. Records are bincode-encoded.

use blobfs_storage::{Extent, NodeHandle};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionAlgorithm;
use crate::digest::Digest;
use crate::error::{BlobError, BlobResult};

/// Extents stored directly in the inode node.
pub const INLINE_EXTENTS: usize = 1;

/// Extents stored in each extent container node.
pub const CONTAINER_EXTENTS: usize = 6;

/// How the data blocks of a blob are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionFlag {
    /// Plaintext.
    #[default]
    None,
    /// LZ4 frame payload.
    Lz4,
    /// Zstandard payload.
    Zstd,
}

impl CompressionFlag {
    /// Flag describing a payload produced with `algo`.
    pub fn from_algorithm(algo: CompressionAlgorithm) -> Self {
        match algo {
            CompressionAlgorithm::None => CompressionFlag::None,
            CompressionAlgorithm::Lz4 => CompressionFlag::Lz4,
            CompressionAlgorithm::Zstd { .. } => CompressionFlag::Zstd,
        }
    }

    /// Algorithm needed to decode, or `None` for plaintext.
    pub fn algorithm(&self) -> Option<CompressionAlgorithm> {
        match self {
            CompressionFlag::None => None,
            CompressionFlag::Lz4 => Some(CompressionAlgorithm::Lz4),
            CompressionFlag::Zstd => Some(CompressionAlgorithm::Zstd { level: 0 }),
        }
    }
}

/// Per-blob metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    /// Plaintext length in bytes.
    pub content_size: u64,
    /// Merkle blocks plus stored data blocks.
    pub block_count: u32,
    /// Expected Merkle root; equals the blob's digest.
    pub merkle_root: Digest,
    /// Encoding of the data blocks.
    pub flags: CompressionFlag,
}

impl InodeRecord {
    /// A record for a blob that has not been committed yet.
    pub fn new(merkle_root: Digest, content_size: u64) -> Self {
        Self {
            content_size,
            block_count: 0,
            merkle_root,
            flags: CompressionFlag::None,
        }
    }
}

/// Contents of one metadata node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRecord {
    /// Head of a blob's node chain.
    Inode {
        /// The metadata record.
        record: InodeRecord,
        /// Inline extents.
        extents: Vec<Extent>,
        /// First extent container, if any.
        next: Option<NodeHandle>,
    },
    /// Overflow extents.
    ExtentContainer {
        /// Preceding node in the chain.
        previous: NodeHandle,
        /// Extents held by this node.
        extents: Vec<Extent>,
        /// Next container, if any.
        next: Option<NodeHandle>,
    },
}

impl NodeRecord {
    /// Serializes the record.
    pub fn encode(&self) -> BlobResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| BlobError::CorruptRecord(e.to_string()))
    }

    /// Deserializes a record.
    pub fn decode(bytes: &[u8]) -> BlobResult<Self> {
        bincode::deserialize(bytes).map_err(|e| BlobError::CorruptRecord(e.to_string()))
    }
}

/// Number of nodes needed to address `extents` extents.
pub fn nodes_for_extents(extents: usize) -> usize {
    if extents <= INLINE_EXTENTS {
        1
    } else {
        1 + (extents - INLINE_EXTENTS).div_ceil(CONTAINER_EXTENTS)
    }
}

/// Lays a record and its extents out over `nodes`, which must hold at
/// least [`nodes_for_extents`] handles. Returns (node, record) pairs in
/// chain order.
pub fn build_chain(
    record: InodeRecord,
    extents: &[Extent],
    nodes: &[NodeHandle],
) -> BlobResult<Vec<(NodeHandle, NodeRecord)>> {
    let needed = nodes_for_extents(extents.len());
    if nodes.len() < needed {
        return Err(BlobError::CorruptRecord(format!(
            "{} extents need {} nodes, have {}",
            extents.len(),
            needed,
            nodes.len()
        )));
    }

    let inline = extents.len().min(INLINE_EXTENTS);
    let mut chain = Vec::with_capacity(needed);
    chain.push((
        nodes[0],
        NodeRecord::Inode {
            record,
            extents: extents[..inline].to_vec(),
            next: (needed > 1).then(|| nodes[1]),
        },
    ));
    for (i, chunk) in extents[inline..].chunks(CONTAINER_EXTENTS).enumerate() {
        let at = i + 1;
        chain.push((
            nodes[at],
            NodeRecord::ExtentContainer {
                previous: nodes[at - 1],
                extents: chunk.to_vec(),
                next: (at + 1 < needed).then(|| nodes[at + 1]),
            },
        ));
    }
    Ok(chain)
}

/// A decoded node chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChain {
    /// The metadata record.
    pub record: InodeRecord,
    /// All extents in order.
    pub extents: Vec<Extent>,
    /// All nodes in chain order, inode first.
    pub nodes: Vec<NodeHandle>,
}

fn fetch<F>(node: NodeHandle, read: &mut F) -> BlobResult<NodeRecord>
where
    F: FnMut(NodeHandle) -> Option<Vec<u8>>,
{
    let bytes = read(node).ok_or_else(|| BlobError::CorruptRecord(format!("{} is empty", node)))?;
    NodeRecord::decode(&bytes)
}

/// Walks a node chain starting at `head`, fetching records with `read`.
pub fn load_chain<F>(head: NodeHandle, mut read: F) -> BlobResult<LoadedChain>
where
    F: FnMut(NodeHandle) -> Option<Vec<u8>>,
{
    let (record, mut extents, mut next) = match fetch(head, &mut read)? {
        NodeRecord::Inode {
            record,
            extents,
            next,
        } => (record, extents, next),
        NodeRecord::ExtentContainer { .. } => {
            return Err(BlobError::CorruptRecord(format!(
                "{} is an extent container, not an inode",
                head
            )))
        }
    };
    let mut nodes = vec![head];

    while let Some(node) = next {
        if nodes.contains(&node) {
            return Err(BlobError::CorruptRecord(format!("cycle at {}", node)));
        }
        match fetch(node, &mut read)? {
            NodeRecord::ExtentContainer {
                previous,
                extents: more,
                next: following,
            } => {
                if nodes.last() != Some(&previous) {
                    return Err(BlobError::CorruptRecord(format!(
                        "{} points back to {}",
                        node, previous
                    )));
                }
                extents.extend(more);
                next = following;
            }
            NodeRecord::Inode { .. } => {
                return Err(BlobError::CorruptRecord(format!(
                    "{} is an inode inside a chain",
                    node
                )))
            }
        }
        nodes.push(node);
    }

    Ok(LoadedChain {
        record,
        extents,
        nodes,
    })
}
