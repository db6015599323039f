//! The blob state machine: reservation, write, commit, materialization,
//! sharing and purge of one content-addressed blob.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blobfs_storage::{
    blocks_for_bytes, total_blocks, Allocator, Extent, NodeHandle, StorageError, TransactionTag,
    WriteRequest, Writeback, WritebackOp,
};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clone_tracker::{BlobClone, CloneRights, CloneTracker};
use crate::compression::decompress;
use crate::config::BlobStoreConfig;
use crate::digest::Digest;
use crate::error::{BlobError, BlobResult};
use crate::extent_stream::{self, ExtentStream};
use crate::inode::{
    build_chain, nodes_for_extents, CompressionFlag, InodeRecord, LoadedChain,
};
use crate::merkle::{self, tree_len, MerkleTree, VerifyError};
use crate::write_state::BlobWriteState;

/// Lifecycle state of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobState {
    /// Created, nothing reserved.
    Empty,
    /// Space reserved, content arriving.
    DataWrite,
    /// Committed and servable.
    Readable,
    /// A write or integrity check failed; the blob is never served.
    Error,
    /// Space returned; the blob is gone.
    Purged,
}

/// Services shared by every blob of a store.
pub struct BlobContext<A: Allocator, W: Writeback> {
    /// Store configuration.
    pub config: Arc<BlobStoreConfig>,
    /// Space allocator.
    pub allocator: Arc<A>,
    /// Writeback subsystem.
    pub writeback: Arc<W>,
    tags: Arc<AtomicU64>,
}

impl<A: Allocator, W: Writeback> BlobContext<A, W> {
    /// Creates a context with a fresh transaction tag sequence.
    pub fn new(config: BlobStoreConfig, allocator: Arc<A>, writeback: Arc<W>) -> Self {
        Self {
            config: Arc::new(config),
            allocator,
            writeback,
            tags: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_tag(&self) -> TransactionTag {
        TransactionTag(self.tags.fetch_add(1, Ordering::Relaxed))
    }

    fn block_size(&self) -> u64 {
        self.config.block_size
    }
}

impl<A: Allocator, W: Writeback> Clone for BlobContext<A, W> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            allocator: Arc::clone(&self.allocator),
            writeback: Arc::clone(&self.writeback),
            tags: Arc::clone(&self.tags),
        }
    }
}

/// One content-addressed blob.
///
/// The mapping is laid out as `[merkle tree | plaintext]`, each region a
/// whole number of blocks. While writing it is a private `BytesMut`; once
/// sealed it is frozen into `Bytes` and shared read-only with clones.
pub struct Blob<A: Allocator, W: Writeback> {
    digest: Digest,
    ctx: BlobContext<A, W>,
    state: BlobState,
    record: InodeRecord,
    extents: Vec<Extent>,
    nodes: Vec<NodeHandle>,
    write: Option<BlobWriteState>,
    staging: Option<BytesMut>,
    mapping: Option<Bytes>,
    verified: bool,
    clones: CloneTracker,
    open_handles: usize,
    deletable: bool,
    integrity_failure: Option<String>,
}

impl<A: Allocator, W: Writeback> Blob<A, W> {
    /// Creates an empty blob named by `digest`.
    pub fn new(digest: Digest, ctx: BlobContext<A, W>) -> Self {
        Self {
            digest,
            ctx,
            state: BlobState::Empty,
            record: InodeRecord::new(digest, 0),
            extents: Vec::new(),
            nodes: Vec::new(),
            write: None,
            staging: None,
            mapping: None,
            verified: false,
            clones: CloneTracker::new(),
            open_handles: 0,
            deletable: false,
            integrity_failure: None,
        }
    }

    /// Rebuilds a committed blob from its decoded node chain. Nothing is read
    /// from the device until the blob is first accessed.
    pub fn from_chain(ctx: BlobContext<A, W>, chain: LoadedChain) -> BlobResult<Self> {
        let record = chain.record;
        let block_size = ctx.block_size();
        let merkle_blocks = blocks_for_bytes(tree_len(record.content_size), block_size);
        let data_blocks = blocks_for_bytes(record.content_size, block_size);
        let block_count = record.block_count as u64;

        if total_blocks(&chain.extents) != block_count {
            return Err(BlobError::CorruptRecord(format!(
                "record claims {} blocks, extents cover {}",
                block_count,
                total_blocks(&chain.extents)
            )));
        }
        let consistent = match record.flags {
            CompressionFlag::None => block_count == merkle_blocks + data_blocks,
            _ => record.content_size > 0 && block_count > merkle_blocks,
        };
        if !consistent {
            return Err(BlobError::CorruptRecord(format!(
                "block count {} inconsistent with content size {} and flags {:?}",
                block_count, record.content_size, record.flags
            )));
        }

        let mut blob = Self::new(record.merkle_root, ctx);
        blob.record = record;
        blob.extents = chain.extents;
        blob.nodes = chain.nodes;
        blob.state = BlobState::Readable;
        if record.content_size == 0 {
            blob.mapping = Some(Bytes::new());
        }
        Ok(blob)
    }

    /// The blob's name.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Current state.
    pub fn state(&self) -> BlobState {
        self.state
    }

    /// The metadata record. Final once the blob is readable.
    pub fn record(&self) -> &InodeRecord {
        &self.record
    }

    /// Committed extents.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Committed metadata nodes, inode first.
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// True while a sealed mapping is held in memory.
    pub fn is_materialized(&self) -> bool {
        self.mapping.is_some()
    }

    /// True if the current mapping passed Merkle verification.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// The clone tracker, for registering a zero-clones callback.
    pub fn clone_tracker(&self) -> &CloneTracker {
        &self.clones
    }

    /// Number of live zero-copy clones.
    pub fn live_clones(&self) -> usize {
        self.clones.live_clones()
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.open_handles
    }

    /// True once [`Blob::mark_deletable`] was called.
    pub fn is_deletable(&self) -> bool {
        self.deletable
    }

    /// Registers an open handle.
    pub fn open_handle(&mut self) -> BlobResult<()> {
        if self.state == BlobState::Purged {
            return Err(BlobError::BadState {
                op: "open",
                state: self.state,
            });
        }
        self.open_handles += 1;
        Ok(())
    }

    /// Drops an open handle; returns the number still open.
    pub fn close_handle(&mut self) -> usize {
        self.open_handles = self.open_handles.saturating_sub(1);
        self.open_handles
    }

    fn merkle_len(&self) -> u64 {
        tree_len(self.record.content_size)
    }

    fn integrity_error(&self, reason: String) -> BlobError {
        BlobError::DataIntegrity {
            digest: self.digest,
            reason,
        }
    }

    /// Moves to `Error` and remembers why the content cannot be trusted.
    fn fail_integrity(&mut self, reason: String) -> BlobError {
        warn!(digest = %self.digest, reason = %reason, "integrity failure");
        self.state = BlobState::Error;
        self.mapping = None;
        self.verified = false;
        self.integrity_failure = Some(reason.clone());
        self.integrity_error(reason)
    }

    fn check_servable(&self, op: &'static str) -> BlobResult<()> {
        match (self.state, &self.integrity_failure) {
            (BlobState::Readable, _) => Ok(()),
            (BlobState::Error, Some(reason)) => Err(self.integrity_error(reason.clone())),
            (state, _) => Err(BlobError::BadState { op, state }),
        }
    }

    /// Reserves space for `content_size` bytes and enters `DataWrite`.
    ///
    /// A zero-length blob needs one node and no blocks; it is committed
    /// immediately and becomes readable.
    #[instrument(skip(self), fields(digest = %self.digest))]
    pub async fn reserve(&mut self, content_size: u64) -> BlobResult<()> {
        if self.state != BlobState::Empty {
            return Err(BlobError::BadState {
                op: "reserve",
                state: self.state,
            });
        }
        if content_size == 0 {
            return self.commit_empty().await;
        }

        let block_size = self.ctx.block_size();
        let merkle_blocks = blocks_for_bytes(tree_len(content_size), block_size);
        let data_blocks = blocks_for_bytes(content_size, block_size);
        let blocks = merkle_blocks + data_blocks;
        if blocks > u32::MAX as u64 {
            return Err(BlobError::Alloc(StorageError::OutOfSpace {
                requested: blocks,
                available: u32::MAX as u64,
            }));
        }

        let allocator = &self.ctx.allocator;
        let extents = allocator.reserve_blocks(blocks).map_err(BlobError::Alloc)?;
        let nodes = match allocator.reserve_nodes(nodes_for_extents(extents.len())) {
            Ok(nodes) => nodes,
            Err(e) => {
                if let Err(release) = allocator.release(&extents, &[]) {
                    warn!(error = %release, "failed to release blocks after node shortage");
                }
                return Err(BlobError::Alloc(e));
            }
        };

        debug!(
            content_size = content_size,
            merkle_blocks = merkle_blocks,
            data_blocks = data_blocks,
            extents = extents.len(),
            nodes = nodes.len(),
            "reserved blob"
        );

        self.record = InodeRecord::new(self.digest, content_size);
        self.staging = Some(BytesMut::zeroed((blocks * block_size) as usize));
        self.write = Some(BlobWriteState::new(
            content_size,
            extents,
            nodes,
            self.ctx.config.compression,
            self.ctx.config.min_savings_threshold,
        ));
        self.state = BlobState::DataWrite;
        Ok(())
    }

    async fn commit_empty(&mut self) -> BlobResult<()> {
        let root = merkle::root_of(&[]);
        if root != self.digest {
            return Err(self.fail_integrity(format!("empty content has root {}", root)));
        }

        let allocator = &self.ctx.allocator;
        let nodes = allocator.reserve_nodes(1).map_err(BlobError::Alloc)?;
        let record = InodeRecord::new(self.digest, 0);
        let result = self.persist(record, &[], &nodes, None).await;
        if let Err(e) = result {
            self.release_reservation(&[], &nodes);
            self.state = BlobState::Error;
            return Err(e);
        }
        if let Err(e) = allocator.commit(&[], &nodes) {
            self.unwind_nodes(&nodes).await;
            self.release_reservation(&[], &nodes);
            self.state = BlobState::Error;
            return Err(BlobError::Alloc(e));
        }

        self.record = record;
        self.nodes = nodes;
        self.mapping = Some(Bytes::new());
        self.verified = true;
        self.state = BlobState::Readable;
        info!(digest = %self.digest, "empty blob committed");
        Ok(())
    }

    /// Consumes up to the remaining content length from `data`; returns the
    /// number of bytes taken. The final byte triggers commit.
    pub async fn write(&mut self, data: &[u8]) -> BlobResult<usize> {
        if self.state != BlobState::DataWrite {
            return Err(BlobError::BadState {
                op: "write",
                state: self.state,
            });
        }
        let merkle_len = self.merkle_len() as usize;
        let (Some(ws), Some(staging)) = (self.write.as_mut(), self.staging.as_mut()) else {
            return Err(BlobError::BadState {
                op: "write",
                state: self.state,
            });
        };

        let take = (data.len() as u64).min(ws.remaining()) as usize;
        let at = merkle_len + ws.bytes_written as usize;
        staging[at..at + take].copy_from_slice(&data[..take]);
        ws.feed(&data[..take]);

        if ws.is_complete() {
            self.finalize().await?;
        }
        Ok(take)
    }

    /// Builds the Merkle tree, streams blocks to the writeback subsystem and
    /// commits the reservation.
    #[instrument(skip(self), fields(digest = %self.digest))]
    async fn finalize(&mut self) -> BlobResult<()> {
        let (Some(mut ws), Some(mut staging)) = (self.write.take(), self.staging.take()) else {
            return Err(BlobError::BadState {
                op: "finalize",
                state: self.state,
            });
        };
        let block_size = self.ctx.block_size();
        let content_size = ws.content_size;
        let merkle_len = self.merkle_len() as usize;

        let tree = MerkleTree::build(&staging[merkle_len..merkle_len + content_size as usize]);
        if tree.root() != self.digest {
            self.release_reservation(&ws.extents, &ws.nodes);
            return Err(self.fail_integrity(format!("content hashes to {}", tree.root())));
        }
        staging[..merkle_len].copy_from_slice(tree.as_bytes());
        let mapping = staging.freeze();

        let merkle_blocks = merkle_len as u64 / block_size;
        let (flags, image) = match ws.take_payload() {
            Some((algorithm, payload)) => {
                let stored = blocks_for_bytes(payload.len() as u64, block_size);
                let mut image = Vec::with_capacity(((merkle_blocks + stored) * block_size) as usize);
                image.extend_from_slice(tree.as_bytes());
                image.extend_from_slice(&payload);
                image.resize(((merkle_blocks + stored) * block_size) as usize, 0);
                (CompressionFlag::from_algorithm(algorithm), Bytes::from(image))
            }
            None => (CompressionFlag::None, mapping.clone()),
        };
        let block_count = image.len() as u64 / block_size;

        let used = extent_stream::clamp(&ws.extents, block_count);
        let unused = extent_stream::excess(&ws.extents, block_count);
        let node_split = nodes_for_extents(used.len()).min(ws.nodes.len());
        let (used_nodes, unused_nodes) = ws.nodes.split_at(node_split);

        let record = InodeRecord {
            content_size,
            block_count: block_count as u32,
            merkle_root: self.digest,
            flags,
        };

        if let Err(e) = self.persist(record, &used, used_nodes, Some(image)).await {
            self.release_reservation(&ws.extents, &ws.nodes);
            self.state = BlobState::Error;
            return Err(e);
        }

        let allocator = &self.ctx.allocator;
        if let Err(e) = allocator.commit(&used, used_nodes) {
            self.unwind_nodes(used_nodes).await;
            self.release_reservation(&ws.extents, &ws.nodes);
            self.state = BlobState::Error;
            return Err(BlobError::Alloc(e));
        }
        if !unused.is_empty() || !unused_nodes.is_empty() {
            self.release_reservation(&unused, unused_nodes);
        }

        info!(
            digest = %self.digest,
            content_size = content_size,
            block_count = block_count,
            flags = ?flags,
            "blob committed"
        );
        self.record = record;
        self.extents = used;
        self.nodes = used_nodes.to_vec();
        self.mapping = Some(mapping);
        self.verified = true;
        self.state = BlobState::Readable;
        Ok(())
    }

    /// Writes `image` over `extents` (merkle blocks first, then data) and
    /// the node chain describing them, as one transaction.
    async fn persist(
        &self,
        record: InodeRecord,
        extents: &[Extent],
        nodes: &[NodeHandle],
        image: Option<Bytes>,
    ) -> BlobResult<u64> {
        let chain = build_chain(record, extents, nodes)?;
        let writeback = &self.ctx.writeback;
        let mut ops = Vec::new();

        let buffer = image.map(|image| writeback.attach(image));
        if let Some(buffer) = buffer {
            for run in ExtentStream::new(extents, record.block_count as u64) {
                ops.push(WritebackOp::Data(WriteRequest {
                    buffer,
                    buffer_block: run.mem_block,
                    device_block: run.dev_block,
                    length: run.length,
                }));
            }
        }
        for (node, node_record) in &chain {
            ops.push(WritebackOp::WriteNode {
                node: *node,
                record: node_record.encode()?,
            });
        }

        let tag = self.ctx.next_tag();
        debug!(tag = tag.0, ops = ops.len(), "enqueueing blob transaction");
        let result = writeback.enqueue(tag, ops).await;
        if let Some(buffer) = buffer {
            writeback.detach(buffer);
        }
        result.map_err(|e| {
            warn!(digest = %self.digest, error = %e, "blob writeback failed");
            BlobError::Write(e)
        })
    }

    /// Clears node records a transaction left behind when the allocator
    /// then refused to commit the space they describe.
    async fn unwind_nodes(&self, nodes: &[NodeHandle]) {
        let ops = nodes
            .iter()
            .map(|&node| WritebackOp::FreeNode { node })
            .collect();
        if let Err(e) = self.ctx.writeback.enqueue(self.ctx.next_tag(), ops).await {
            warn!(digest = %self.digest, error = %e, "failed to clear node records");
        }
    }

    fn release_reservation(&self, extents: &[Extent], nodes: &[NodeHandle]) {
        if let Err(e) = self.ctx.allocator.release(extents, nodes) {
            warn!(digest = %self.digest, error = %e, "failed to release reservation");
        }
    }

    /// Reads every stored block of the blob, in image order.
    async fn read_image(&self) -> BlobResult<Vec<u8>> {
        let block_size = self.ctx.block_size();
        let block_count = self.record.block_count as u64;

        let mut image = vec![0u8; (block_count * block_size) as usize];
        let mut runs = ExtentStream::new(&self.extents, block_count);
        for run in runs.by_ref() {
            let bytes = self
                .ctx
                .writeback
                .read_blocks(run.dev_block, run.length)
                .await
                .map_err(BlobError::Read)?;
            let at = (run.mem_block * block_size) as usize;
            image[at..at + bytes.len()].copy_from_slice(&bytes);
        }
        if runs.remaining() != 0 {
            return Err(BlobError::CorruptRecord(format!(
                "extents end {} blocks short",
                runs.remaining()
            )));
        }
        Ok(image)
    }

    /// Turns a stored image into the mapping layout, decompressing the
    /// payload if the record says it is compressed.
    fn decode_image(&self, mut image: Vec<u8>) -> Result<Vec<u8>, VerifyError> {
        let Some(algorithm) = self.record.flags.algorithm() else {
            return Ok(image);
        };
        let content_size = self.record.content_size as usize;
        let merkle_len = self.merkle_len() as usize;
        let plain = decompress(algorithm, &image[merkle_len..], content_size).map_err(|e| {
            VerifyError::Undecodable {
                reason: e.to_string(),
            }
        })?;
        let data_blocks = blocks_for_bytes(content_size as u64, self.ctx.block_size());
        image.truncate(merkle_len);
        image.extend_from_slice(&plain);
        image.resize(merkle_len + (data_blocks * self.ctx.block_size()) as usize, 0);
        Ok(image)
    }

    /// Checks a mapping-layout image against the digest.
    fn check_image(&self, image: &[u8]) -> Result<(), VerifyError> {
        let content_size = self.record.content_size as usize;
        let (tree, rest) = image.split_at(self.merkle_len() as usize);
        merkle::verify(
            &rest[..content_size],
            tree,
            &self.digest,
            0,
            content_size as u64,
        )
    }

    /// Loads the mapping from the device if it is not held: reads every
    /// stored run, decompresses, and verifies against the digest. Nothing is
    /// copied or cloned out of a mapping that did not verify.
    #[instrument(skip(self), fields(digest = %self.digest))]
    async fn materialize(&mut self) -> BlobResult<()> {
        if self.mapping.is_some() {
            return Ok(());
        }
        let image = self.read_image().await?;
        let checked = self
            .decode_image(image)
            .and_then(|image| self.check_image(&image).map(|()| image));
        let image = match checked {
            Ok(image) => image,
            Err(e) => return Err(self.fail_integrity(e.to_string())),
        };

        debug!(block_count = self.record.block_count, "materialized blob");
        self.verified = true;
        self.mapping = Some(Bytes::from(image));
        Ok(())
    }

    /// Copies content starting at `offset` into `buf`; returns bytes copied.
    pub async fn read(&mut self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        self.check_servable("read")?;
        let content_size = self.record.content_size;
        if content_size == 0 || offset >= content_size {
            return Ok(0);
        }
        self.materialize().await?;
        let Some(mapping) = self.mapping.as_ref() else {
            return Err(self.integrity_error("mapping unavailable".into()));
        };

        let n = (buf.len() as u64).min(content_size - offset) as usize;
        let at = (self.merkle_len() + offset) as usize;
        buf[..n].copy_from_slice(&mapping[at..at + n]);
        Ok(n)
    }

    /// Hands out a tracked, read-only, zero-copy view of the content.
    pub async fn clone_readable_region(&mut self, rights: CloneRights) -> BlobResult<BlobClone> {
        if rights.write {
            return Err(BlobError::Clone {
                reason: "write access is never granted",
            });
        }
        if !rights.read {
            return Err(BlobError::Clone {
                reason: "read access required",
            });
        }
        self.check_servable("clone")?;
        if self.record.content_size == 0 {
            return Err(BlobError::Clone {
                reason: "empty blob has no shareable region",
            });
        }
        self.materialize().await?;
        let Some(mapping) = self.mapping.as_ref() else {
            return Err(self.integrity_error("mapping unavailable".into()));
        };

        let start = self.merkle_len() as usize;
        let region = mapping.slice(start..start + self.record.content_size as usize);
        let clone = BlobClone::new(region, rights, self.clones.lease());
        debug!(digest = %self.digest, live = self.clones.live_clones(), "clone handed out");
        Ok(clone)
    }

    /// Re-verifies the whole content against the digest, reading the stored
    /// blocks from the device rather than trusting the held mapping. A
    /// failure moves the blob to `Error`; it is never served again.
    #[instrument(skip(self), fields(digest = %self.digest))]
    pub async fn verify(&mut self) -> BlobResult<()> {
        self.check_servable("verify")?;
        if self.record.content_size == 0 {
            let actual = merkle::root_of(&[]);
            if actual != self.digest {
                let e = VerifyError::RootMismatch {
                    expected: self.digest,
                    actual,
                };
                self.fail_integrity(e.to_string());
                return Err(e.into());
            }
            return Ok(());
        }

        let image = self.read_image().await?;
        let checked = self
            .decode_image(image)
            .and_then(|image| self.check_image(&image));
        if let Err(e) = checked {
            self.fail_integrity(e.to_string());
            return Err(e.into());
        }
        debug!(digest = %self.digest, "stored content verified");
        Ok(())
    }

    /// Flags the blob for removal once nothing references it.
    pub fn mark_deletable(&mut self) {
        self.deletable = true;
    }

    /// Purges the blob if it is deletable with no open handles and no live
    /// clones. Returns whether it is now purged.
    #[instrument(skip(self), fields(digest = %self.digest))]
    pub async fn try_purge(&mut self) -> BlobResult<bool> {
        if self.state == BlobState::Purged {
            return Ok(true);
        }
        if !self.deletable || self.open_handles > 0 || self.clones.live_clones() > 0 {
            debug!(
                deletable = self.deletable,
                open_handles = self.open_handles,
                live_clones = self.clones.live_clones(),
                "purge deferred"
            );
            return Ok(false);
        }

        match self.state {
            BlobState::Readable => {
                let ops = self
                    .nodes
                    .iter()
                    .map(|&node| WritebackOp::FreeNode { node })
                    .collect();
                self.ctx
                    .writeback
                    .enqueue(self.ctx.next_tag(), ops)
                    .await
                    .map_err(BlobError::Write)?;

                // The node table no longer describes the blob.
                let extents = std::mem::take(&mut self.extents);
                let nodes = std::mem::take(&mut self.nodes);
                self.mapping = None;
                self.verified = false;
                self.state = BlobState::Purged;

                let allocator = &self.ctx.allocator;
                let mut freed = allocator.free_extents(&extents);
                for node in &nodes {
                    let result = allocator.free_node(*node);
                    if freed.is_ok() {
                        freed = result;
                    }
                }
                if let Err(e) = freed {
                    warn!(digest = %self.digest, error = %e, "blob purged, space not fully freed");
                    return Err(BlobError::Alloc(e));
                }
            }
            BlobState::DataWrite => {
                if let Some(ws) = self.write.take() {
                    self.release_reservation(&ws.extents, &ws.nodes);
                }
                self.staging = None;
            }
            BlobState::Empty | BlobState::Error | BlobState::Purged => {}
        }

        self.mapping = None;
        self.verified = false;
        self.state = BlobState::Purged;
        info!(digest = %self.digest, "blob purged");
        Ok(true)
    }

    /// Drops a sealed mapping that no clone references. The next access
    /// reads it back from the device and verifies it again.
    pub fn evict_mapping(&mut self) -> bool {
        if self.state != BlobState::Readable
            || self.record.content_size == 0
            || self.mapping.is_none()
            || self.clones.live_clones() > 0
        {
            return false;
        }
        self.mapping = None;
        self.verified = false;
        debug!(digest = %self.digest, "evicted mapping");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobfs_storage::{
        AllocatorConfig, AllocatorStats, DeviceConfig, ExtentAllocator, JournalConfig,
        JournalWriteback, MemBlockDevice, StorageResult,
    };
    use std::sync::atomic::AtomicBool;

    type TestBlob = Blob<ExtentAllocator, JournalWriteback<MemBlockDevice>>;

    fn context() -> BlobContext<ExtentAllocator, JournalWriteback<MemBlockDevice>> {
        let allocator = Arc::new(ExtentAllocator::new(AllocatorConfig {
            total_blocks: 256,
            total_nodes: 64,
            max_extent_length: 4,
        }));
        let device = Arc::new(MemBlockDevice::new(DeviceConfig {
            block_size: 4096,
            block_count: 256,
        }));
        let writeback = Arc::new(JournalWriteback::new(JournalConfig::default(), device));
        BlobContext::new(BlobStoreConfig::default(), allocator, writeback)
    }

    /// Delegates to an `ExtentAllocator`, refusing commits or frees on demand.
    struct FlakyAllocator {
        inner: ExtentAllocator,
        fail_commit: AtomicBool,
        fail_free: AtomicBool,
    }

    fn refused() -> StorageError {
        StorageError::DeviceError {
            reason: "refused".into(),
        }
    }

    impl Allocator for FlakyAllocator {
        fn reserve_blocks(&self, count: u64) -> StorageResult<Vec<Extent>> {
            self.inner.reserve_blocks(count)
        }

        fn reserve_nodes(&self, count: usize) -> StorageResult<Vec<NodeHandle>> {
            self.inner.reserve_nodes(count)
        }

        fn commit(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(refused());
            }
            self.inner.commit(extents, nodes)
        }

        fn release(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
            self.inner.release(extents, nodes)
        }

        fn free_node(&self, node: NodeHandle) -> StorageResult<()> {
            if self.fail_free.load(Ordering::SeqCst) {
                return Err(refused());
            }
            self.inner.free_node(node)
        }

        fn free_extents(&self, extents: &[Extent]) -> StorageResult<()> {
            if self.fail_free.load(Ordering::SeqCst) {
                return Err(refused());
            }
            self.inner.free_extents(extents)
        }

        fn stats(&self) -> AllocatorStats {
            self.inner.stats()
        }
    }

    fn flaky_context() -> BlobContext<FlakyAllocator, JournalWriteback<MemBlockDevice>> {
        let allocator = Arc::new(FlakyAllocator {
            inner: ExtentAllocator::new(AllocatorConfig {
                total_blocks: 256,
                total_nodes: 64,
                max_extent_length: 4,
            }),
            fail_commit: AtomicBool::new(false),
            fail_free: AtomicBool::new(false),
        });
        let device = Arc::new(MemBlockDevice::new(DeviceConfig {
            block_size: 4096,
            block_count: 256,
        }));
        let writeback = Arc::new(JournalWriteback::new(JournalConfig::default(), device));
        BlobContext::new(BlobStoreConfig::default(), allocator, writeback)
    }

    async fn written(data: &[u8]) -> TestBlob {
        let mut blob = Blob::new(merkle::root_of(data), context());
        blob.reserve(data.len() as u64).await.unwrap();
        let mut at = 0;
        while at < data.len() {
            at += blob.write(&data[at..]).await.unwrap();
        }
        blob
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let data = patterned(20_000);
        let mut blob = written(&data).await;
        assert_eq!(blob.state(), BlobState::Readable);
        assert!(blob.is_verified());

        let mut out = vec![0u8; data.len()];
        assert_eq!(blob.read(&mut out, 0).await.unwrap(), data.len());
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_write_clamps_to_content_size() {
        let data = patterned(100);
        let mut blob = Blob::new(merkle::root_of(&data), context());
        blob.reserve(100).await.unwrap();
        assert_eq!(blob.write(&data[..60]).await.unwrap(), 60);
        assert_eq!(blob.state(), BlobState::DataWrite);
        let mut tail = data[60..].to_vec();
        tail.extend_from_slice(b"extra");
        assert_eq!(blob.write(&tail).await.unwrap(), 40);
        assert_eq!(blob.state(), BlobState::Readable);
        assert!(matches!(
            blob.write(b"more").await,
            Err(BlobError::BadState { op: "write", .. })
        ));
    }

    #[tokio::test]
    async fn test_read_before_readable_rejected() {
        let data = patterned(100);
        let mut blob = Blob::new(merkle::root_of(&data), context());
        let mut buf = [0u8; 10];
        assert!(matches!(
            blob.read(&mut buf, 0).await,
            Err(BlobError::BadState { state: BlobState::Empty, .. })
        ));
        blob.reserve(100).await.unwrap();
        assert!(matches!(
            blob.read(&mut buf, 0).await,
            Err(BlobError::BadState { state: BlobState::DataWrite, .. })
        ));
        assert!(matches!(
            blob.reserve(100).await,
            Err(BlobError::BadState { op: "reserve", .. })
        ));
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_write() {
        let ctx = context();
        let allocator = Arc::clone(&ctx.allocator);
        let mut blob = Blob::new(merkle::root_of(b"expected"), ctx);
        blob.reserve(8).await.unwrap();
        let err = blob.write(b"mistaken").await.unwrap_err();
        assert!(matches!(err, BlobError::DataIntegrity { .. }));
        assert_eq!(blob.state(), BlobState::Error);

        let stats = allocator.stats();
        assert_eq!(stats.reserved_blocks, 0);
        assert_eq!(stats.reserved_nodes, 0);

        let mut buf = [0u8; 8];
        assert!(matches!(
            blob.read(&mut buf, 0).await,
            Err(BlobError::DataIntegrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_compressed_commit_releases_excess() {
        let data = vec![b'z'; 64 * 1024];
        let ctx = context();
        let allocator = Arc::clone(&ctx.allocator);
        let mut blob = Blob::new(merkle::root_of(&data), ctx);
        blob.reserve(data.len() as u64).await.unwrap();
        blob.write(&data).await.unwrap();

        let record = *blob.record();
        assert_eq!(record.flags, CompressionFlag::Zstd);
        // One merkle block plus one block of compressed payload.
        assert_eq!(record.block_count, 2);
        assert_eq!(total_blocks(blob.extents()), 2);

        let stats = allocator.stats();
        assert_eq!(stats.allocated_blocks, 2);
        assert_eq!(stats.reserved_blocks, 0);
        assert_eq!(stats.allocated_nodes, blob.nodes().len());
        assert_eq!(stats.reserved_nodes, 0);
    }

    #[tokio::test]
    async fn test_evicted_mapping_reloads_and_verifies() {
        let data = patterned(50_000);
        let mut blob = written(&data).await;
        assert!(blob.evict_mapping());
        assert!(!blob.is_materialized());

        let mut out = vec![0u8; 1000];
        assert_eq!(blob.read(&mut out, 49_500).await.unwrap(), 500);
        assert_eq!(&out[..500], &data[49_500..]);
        assert!(blob.is_verified());
    }

    #[tokio::test]
    async fn test_clone_blocks_eviction_and_purge() {
        let data = patterned(9000);
        let mut blob = written(&data).await;
        let clone = blob.clone_readable_region(CloneRights::READ).await.unwrap();
        assert_eq!(&*clone, &data[..]);

        assert!(!blob.evict_mapping());
        blob.mark_deletable();
        assert!(!blob.try_purge().await.unwrap());
        assert_eq!(blob.state(), BlobState::Readable);

        drop(clone);
        assert!(blob.try_purge().await.unwrap());
        assert_eq!(blob.state(), BlobState::Purged);
    }

    #[tokio::test]
    async fn test_clone_rights_and_empty() {
        let mut blob = written(b"").await;
        assert_eq!(blob.state(), BlobState::Readable);
        assert!(matches!(
            blob.clone_readable_region(CloneRights::READ).await,
            Err(BlobError::Clone { .. })
        ));

        let mut blob = written(b"content").await;
        let rw = CloneRights {
            read: true,
            write: true,
        };
        assert!(matches!(
            blob.clone_readable_region(rw).await,
            Err(BlobError::Clone { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_in_data_write_releases() {
        let ctx = context();
        let allocator = Arc::clone(&ctx.allocator);
        let mut blob = Blob::new(merkle::root_of(&patterned(10_000)), ctx);
        blob.reserve(10_000).await.unwrap();
        assert!(allocator.stats().reserved_blocks > 0);

        blob.mark_deletable();
        assert!(blob.try_purge().await.unwrap());
        let stats = allocator.stats();
        assert_eq!(stats.reserved_blocks, 0);
        assert_eq!(stats.reserved_nodes, 0);
        assert_eq!(stats.free_blocks, stats.total_blocks);
    }

    #[tokio::test]
    async fn test_handles_block_purge() {
        let mut blob = written(b"handle test").await;
        blob.open_handle().unwrap();
        blob.mark_deletable();
        assert!(!blob.try_purge().await.unwrap());
        assert_eq!(blob.close_handle(), 0);
        assert!(blob.try_purge().await.unwrap());
        assert!(blob.open_handle().is_err());
    }

    #[tokio::test]
    async fn test_commit_failure_clears_node_records() {
        let ctx = flaky_context();
        let allocator = Arc::clone(&ctx.allocator);
        let writeback = Arc::clone(&ctx.writeback);
        allocator.fail_commit.store(true, Ordering::SeqCst);

        let data = patterned(20_000);
        let mut blob = Blob::new(merkle::root_of(&data), ctx);
        blob.reserve(data.len() as u64).await.unwrap();
        assert!(matches!(blob.write(&data).await, Err(BlobError::Alloc(_))));
        assert_eq!(blob.state(), BlobState::Error);
        assert_eq!(writeback.node_count(), 0);

        let stats = allocator.stats();
        assert_eq!(stats.reserved_blocks, 0);
        assert_eq!(stats.reserved_nodes, 0);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.allocated_nodes, 0);
    }

    #[tokio::test]
    async fn test_empty_commit_failure_clears_node_record() {
        let ctx = flaky_context();
        let allocator = Arc::clone(&ctx.allocator);
        let writeback = Arc::clone(&ctx.writeback);
        allocator.fail_commit.store(true, Ordering::SeqCst);

        let mut blob = Blob::new(merkle::root_of(&[]), ctx);
        assert!(matches!(blob.reserve(0).await, Err(BlobError::Alloc(_))));
        assert_eq!(blob.state(), BlobState::Error);
        assert_eq!(writeback.node_count(), 0);
        assert_eq!(allocator.stats().reserved_nodes, 0);
    }

    #[tokio::test]
    async fn test_purge_with_failed_free_is_still_purged() {
        let ctx = flaky_context();
        let allocator = Arc::clone(&ctx.allocator);
        let writeback = Arc::clone(&ctx.writeback);

        let data = patterned(9000);
        let mut blob = Blob::new(merkle::root_of(&data), ctx);
        blob.reserve(data.len() as u64).await.unwrap();
        blob.write(&data).await.unwrap();
        let inode = blob.nodes()[0];
        assert!(writeback.read_node(inode).is_some());

        allocator.fail_free.store(true, Ordering::SeqCst);
        blob.mark_deletable();
        assert!(matches!(blob.try_purge().await, Err(BlobError::Alloc(_))));
        assert_eq!(blob.state(), BlobState::Purged);
        assert!(blob.nodes().is_empty());
        assert!(writeback.read_node(inode).is_none());

        let mut buf = [0u8; 16];
        assert!(matches!(
            blob.read(&mut buf, 0).await,
            Err(BlobError::BadState { state: BlobState::Purged, .. })
        ));
        assert!(blob.try_purge().await.unwrap());
    }

    #[tokio::test]
    async fn test_alloc_failure_leaves_empty() {
        let data = patterned(2 * 1024 * 1024);
        let mut blob = Blob::new(merkle::root_of(&data), context());
        assert!(matches!(
            blob.reserve(data.len() as u64).await,
            Err(BlobError::Alloc(_))
        ));
        assert_eq!(blob.state(), BlobState::Empty);
    }
}
