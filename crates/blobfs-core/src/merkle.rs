//! Merkle tree over fixed-size nodes of blob content.
//!
//! Content is split into [`NODE_SIZE`] leaves. Each leaf is hashed with its
//! level and byte offset mixed in, the leaf digests are packed into
//! node-sized chunks, and those chunks are hashed the same way one level up,
//! until a single digest (the root) remains. The serialized tree holds every
//! digest level except the root, each level zero-padded to a whole node.
//! Content of at most one node has an empty tree: its root is the leaf hash.

use crate::digest::{Digest, DIGEST_LEN};

/// Size of a tree node (and of a content leaf) in bytes.
pub const NODE_SIZE: usize = 4096;

/// Failures of Merkle verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The tree buffer does not have the size the content length implies.
    #[error("merkle tree is {actual} bytes, expected {expected}")]
    TreeLength {
        /// Expected tree length.
        expected: u64,
        /// Actual tree length.
        actual: u64,
    },
    /// The requested range is not inside the content.
    #[error("range {offset}+{len} outside content of {data_len} bytes")]
    RangeOutOfBounds {
        /// Range start.
        offset: u64,
        /// Range length.
        len: u64,
        /// Content length.
        data_len: u64,
    },
    /// A recomputed digest does not match the stored one.
    #[error("digest mismatch at level {level}, node {index}")]
    NodeMismatch {
        /// Tree level (0 = content leaves).
        level: usize,
        /// Node index within the level.
        index: usize,
    },
    /// Padding after a level's digests is not zero.
    #[error("non-zero padding after level {level}")]
    NonZeroPadding {
        /// Tree level.
        level: usize,
    },
    /// The stored payload could not be decompressed back to the content.
    #[error("stored payload does not decode: {reason}")]
    Undecodable {
        /// Decoder error.
        reason: String,
    },
    /// The top of the tree does not hash to the expected root.
    #[error("root mismatch: expected {expected}, computed {actual}")]
    RootMismatch {
        /// Expected root.
        expected: Digest,
        /// Computed root.
        actual: Digest,
    },
}

/// Where one digest level lives inside the serialized tree.
#[derive(Debug, Clone, Copy)]
struct Level {
    offset: usize,
    digests: usize,
}

impl Level {
    fn digest_bytes(&self) -> usize {
        self.digests * DIGEST_LEN
    }

    fn padded_end(&self) -> usize {
        self.offset + round_up(self.digest_bytes())
    }
}

fn round_up(len: usize) -> usize {
    len.div_ceil(NODE_SIZE) * NODE_SIZE
}

fn layout(data_len: u64) -> Vec<Level> {
    let mut count = (data_len as usize).div_ceil(NODE_SIZE).max(1);
    let mut offset = 0;
    let mut levels = Vec::new();
    while count > 1 {
        let level = Level {
            offset,
            digests: count,
        };
        offset = level.padded_end();
        count = level.digest_bytes().div_ceil(NODE_SIZE);
        levels.push(level);
    }
    levels
}

/// Length in bytes of the serialized tree for content of `data_len` bytes.
pub fn tree_len(data_len: u64) -> u64 {
    layout(data_len).last().map_or(0, |l| l.padded_end() as u64)
}

fn hash_node(level: usize, offset: usize, bytes: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(level as u32).to_le_bytes());
    hasher.update(&(offset as u64).to_le_bytes());
    hasher.update(&(bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
    hasher.finalize().into()
}

fn hash_level(level: usize, bytes: &[u8]) -> Vec<Digest> {
    if bytes.is_empty() {
        return vec![hash_node(level, 0, bytes)];
    }
    bytes
        .chunks(NODE_SIZE)
        .enumerate()
        .map(|(i, chunk)| hash_node(level, i * NODE_SIZE, chunk))
        .collect()
}

/// A built Merkle tree: serialized levels plus root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    bytes: Vec<u8>,
    root: Digest,
}

impl MerkleTree {
    /// Builds the tree over `data`.
    pub fn build(data: &[u8]) -> Self {
        let mut tree = Vec::with_capacity(tree_len(data.len() as u64) as usize);
        let mut digests = hash_level(0, data);
        let mut level = 1;
        while digests.len() > 1 {
            let start = tree.len();
            for d in &digests {
                tree.extend_from_slice(d.as_bytes());
            }
            let next = hash_level(level, &tree[start..]);
            tree.resize(round_up(tree.len()), 0);
            digests = next;
            level += 1;
        }
        Self {
            bytes: tree,
            root: digests[0],
        }
    }

    /// Root digest.
    pub fn root(&self) -> Digest {
        self.root
    }

    /// Serialized tree.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the tree, returning the serialized levels.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Merkle root of `data`; the name a blob with this content must be created under.
pub fn root_of(data: &[u8]) -> Digest {
    MerkleTree::build(data).root()
}

/// Verifies `data[offset..offset + len]` against `tree` and `expected_root`.
///
/// Only the leaves intersecting the range are rehashed. Every digest level
/// above the leaves is checked up to the root, so a tampered tree is
/// detected regardless of the range.
pub fn verify(
    data: &[u8],
    tree: &[u8],
    expected_root: &Digest,
    offset: u64,
    len: u64,
) -> Result<(), VerifyError> {
    let data_len = data.len() as u64;
    let expected_len = tree_len(data_len);
    if tree.len() as u64 != expected_len {
        return Err(VerifyError::TreeLength {
            expected: expected_len,
            actual: tree.len() as u64,
        });
    }
    if offset.checked_add(len).map_or(true, |end| end > data_len) {
        return Err(VerifyError::RangeOutOfBounds {
            offset,
            len,
            data_len,
        });
    }

    let levels = layout(data_len);
    if levels.is_empty() {
        let actual = hash_level(0, data)[0];
        if actual != *expected_root {
            return Err(VerifyError::RootMismatch {
                expected: *expected_root,
                actual,
            });
        }
        return Ok(());
    }

    let leaves = levels[0];
    if len > 0 {
        let first = (offset / NODE_SIZE as u64) as usize;
        let last = ((offset + len - 1) / NODE_SIZE as u64) as usize;
        for index in first..=last {
            let start = index * NODE_SIZE;
            let end = (start + NODE_SIZE).min(data.len());
            let computed = hash_node(0, start, &data[start..end]);
            let at = leaves.offset + index * DIGEST_LEN;
            if tree[at..at + DIGEST_LEN] != computed.0 {
                return Err(VerifyError::NodeMismatch { level: 0, index });
            }
        }
    }

    for (k, level) in levels.iter().enumerate() {
        let digest_end = level.offset + level.digest_bytes();
        if tree[digest_end..level.padded_end()].iter().any(|&b| b != 0) {
            return Err(VerifyError::NonZeroPadding { level: k });
        }
        let computed = hash_level(k + 1, &tree[level.offset..digest_end]);
        match levels.get(k + 1) {
            Some(parent) => {
                for (index, digest) in computed.iter().enumerate() {
                    let at = parent.offset + index * DIGEST_LEN;
                    if tree[at..at + DIGEST_LEN] != digest.0 {
                        return Err(VerifyError::NodeMismatch {
                            level: k + 1,
                            index,
                        });
                    }
                }
            }
            None => {
                if computed[0] != *expected_root {
                    return Err(VerifyError::RootMismatch {
                        expected: *expected_root,
                        actual: computed[0],
                    });
                }
            }
        }
    }
    Ok(())
}
