//! The blob store: digest-keyed blobs, open handles, and idle-mapping
//! reclamation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use blobfs_storage::{Allocator, NodeHandle, Writeback};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::{Blob, BlobContext, BlobState};
use crate::clone_tracker::{BlobClone, CloneRights};
use crate::config::BlobStoreConfig;
use crate::digest::Digest;
use crate::error::{BlobError, BlobResult};
use crate::inode::{load_chain, InodeRecord};

/// Identifies an open handle on a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// What an open handle may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleKind {
    /// The single handle returned by [`BlobStore::create`].
    Writer,
    /// Read-only handle from [`BlobStore::open`].
    Reader,
}

#[derive(Debug, Clone, Copy)]
struct OpenHandle {
    digest: Digest,
    kind: HandleKind,
}

/// Snapshot of store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreStats {
    /// Blobs currently held (any state but purged).
    pub blobs: usize,
    /// Blobs in the readable state.
    pub readable: usize,
    /// Blobs whose mapping is in memory.
    pub materialized: usize,
    /// Open handles across all blobs.
    pub open_handles: usize,
    /// Live clones across all blobs.
    pub live_clones: usize,
    /// Blobs created since start.
    pub created: u64,
    /// Blobs loaded from the node table since start.
    pub loaded: u64,
    /// Blobs purged since start.
    pub purged: u64,
    /// Mappings evicted since start.
    pub evictions: u64,
}

/// Content-addressed store of immutable blobs.
///
/// All methods take `&mut self`: a store is driven from one task, and only
/// writeback completions and device reads suspend.
pub struct BlobStore<A: Allocator, W: Writeback> {
    ctx: BlobContext<A, W>,
    blobs: HashMap<Digest, Blob<A, W>>,
    handles: HashMap<u64, OpenHandle>,
    next_handle: u64,
    idle: Arc<Mutex<VecDeque<Digest>>>,
    stats: BlobStoreStats,
}

impl<A: Allocator, W: Writeback> BlobStore<A, W> {
    /// Creates a store over the given collaborators.
    pub fn new(config: BlobStoreConfig, allocator: Arc<A>, writeback: Arc<W>) -> BlobResult<Self> {
        config.validate()?;
        if config.block_size != writeback.block_size() {
            return Err(BlobError::Config(format!(
                "block_size {} does not match device block size {}",
                config.block_size,
                writeback.block_size()
            )));
        }
        info!(
            block_size = config.block_size,
            compression = ?config.compression,
            "blob store ready"
        );
        Ok(Self {
            ctx: BlobContext::new(config, allocator, writeback),
            blobs: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            idle: Arc::new(Mutex::new(VecDeque::new())),
            stats: BlobStoreStats::default(),
        })
    }

    /// The configuration in effect.
    pub fn config(&self) -> &BlobStoreConfig {
        &self.ctx.config
    }

    /// The allocator the store reserves from.
    pub fn allocator(&self) -> &Arc<A> {
        &self.ctx.allocator
    }

    /// The writeback subsystem the store persists through.
    pub fn writeback(&self) -> &Arc<W> {
        &self.ctx.writeback
    }

    fn track(&mut self, blob: Blob<A, W>) {
        let digest = *blob.digest();
        let idle = Arc::clone(&self.idle);
        blob.clone_tracker()
            .set_on_zero(move || idle.lock().push_back(digest));
        self.blobs.insert(digest, blob);
    }

    fn issue_handle(&mut self, digest: Digest, kind: HandleKind) -> HandleId {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(id, OpenHandle { digest, kind });
        HandleId(id)
    }

    fn blob_mut(&mut self, digest: &Digest) -> BlobResult<&mut Blob<A, W>> {
        self.blobs
            .get_mut(digest)
            .ok_or(BlobError::NotFound(*digest))
    }

    fn resolve(&self, handle: HandleId) -> BlobResult<OpenHandle> {
        self.handles
            .get(&handle.0)
            .copied()
            .ok_or(BlobError::InvalidHandle(handle.0))
    }

    /// Creates the blob named `digest` with room for `content_size` bytes
    /// and returns its writer handle.
    pub async fn create(&mut self, digest: Digest, content_size: u64) -> BlobResult<HandleId> {
        if self.blobs.contains_key(&digest) {
            return Err(BlobError::AlreadyExists(digest));
        }
        let mut blob = Blob::new(digest, self.ctx.clone());
        blob.reserve(content_size).await?;
        blob.open_handle()?;
        self.track(blob);
        self.stats.created += 1;
        debug!(digest = %digest, content_size = content_size, "blob created");
        Ok(self.issue_handle(digest, HandleKind::Writer))
    }

    /// Opens a read handle on an existing blob.
    pub fn open(&mut self, digest: &Digest) -> BlobResult<HandleId> {
        self.blob_mut(digest)?.open_handle()?;
        Ok(self.issue_handle(*digest, HandleKind::Reader))
    }

    /// Closes a handle. Closing the last handle of a deletable blob purges it.
    pub async fn close(&mut self, handle: HandleId) -> BlobResult<()> {
        let open = self
            .handles
            .remove(&handle.0)
            .ok_or(BlobError::InvalidHandle(handle.0))?;
        let blob = self.blob_mut(&open.digest)?;
        if blob.close_handle() == 0 && blob.is_deletable() {
            self.purge_if_possible(&open.digest).await?;
        }
        Ok(())
    }

    /// Appends content through a writer handle; returns bytes consumed.
    pub async fn write(&mut self, handle: HandleId, data: &[u8]) -> BlobResult<usize> {
        let open = self.resolve(handle)?;
        if open.kind != HandleKind::Writer {
            return Err(BlobError::InvalidHandle(handle.0));
        }
        self.blob_mut(&open.digest)?.write(data).await
    }

    /// Reads content at `offset` into `buf` through any handle.
    pub async fn read(&mut self, handle: HandleId, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        let open = self.resolve(handle)?;
        self.blob_mut(&open.digest)?.read(buf, offset).await
    }

    /// Returns a zero-copy, read-only view of the blob's content.
    pub async fn get_shareable_region(
        &mut self,
        handle: HandleId,
        rights: CloneRights,
    ) -> BlobResult<BlobClone> {
        let open = self.resolve(handle)?;
        self.blob_mut(&open.digest)?
            .clone_readable_region(rights)
            .await
    }

    /// Flags a blob for removal.
    pub fn mark_deletable(&mut self, digest: &Digest) -> BlobResult<()> {
        self.blob_mut(digest)?.mark_deletable();
        Ok(())
    }

    /// Purges a deletable blob if nothing references it. Returns whether
    /// it was purged.
    pub async fn try_purge(&mut self, digest: &Digest) -> BlobResult<bool> {
        if !self.blobs.contains_key(digest) {
            return Err(BlobError::NotFound(*digest));
        }
        self.purge_if_possible(digest).await
    }

    async fn purge_if_possible(&mut self, digest: &Digest) -> BlobResult<bool> {
        let Some(blob) = self.blobs.get_mut(digest) else {
            return Ok(false);
        };
        let purged = blob.try_purge().await;
        // A purge whose frees failed still leaves the blob unreachable.
        if blob.state() != BlobState::Purged {
            return purged;
        }
        self.blobs.remove(digest);
        self.stats.purged += 1;
        purged.map(|_| true)
    }

    /// Fully re-verifies a blob's content against its digest.
    pub async fn verify(&mut self, digest: &Digest) -> BlobResult<()> {
        self.blob_mut(digest)?.verify().await
    }

    /// Inserts a committed blob from the node chain starting at `node`.
    /// Its content is read from the device on first access.
    pub fn load(&mut self, node: NodeHandle) -> BlobResult<Digest> {
        let writeback = Arc::clone(&self.ctx.writeback);
        let chain = load_chain(node, |n| writeback.read_node(n))?;
        let digest = chain.record.merkle_root;
        if self.blobs.contains_key(&digest) {
            return Err(BlobError::AlreadyExists(digest));
        }
        let blob = Blob::from_chain(self.ctx.clone(), chain)?;
        self.track(blob);
        self.stats.loaded += 1;
        debug!(digest = %digest, node = %node, "blob loaded");
        Ok(digest)
    }

    /// Drops mappings nothing uses: blobs whose last clone went away since
    /// the previous call, and blobs with no handles and no clones. Deletable
    /// blobs that became unreferenced are purged. Returns mappings evicted.
    pub async fn evict_idle(&mut self) -> BlobResult<usize> {
        let queued: Vec<Digest> = self.idle.lock().drain(..).collect();
        let mut candidates: Vec<Digest> = self
            .blobs
            .iter()
            .filter(|(_, b)| b.open_handles() == 0 && b.live_clones() == 0)
            .map(|(d, _)| *d)
            .collect();
        for digest in queued {
            if !candidates.contains(&digest) {
                candidates.push(digest);
            }
        }

        let mut evicted = 0;
        for digest in candidates {
            let Some(blob) = self.blobs.get_mut(&digest) else {
                continue;
            };
            if blob.is_deletable() && blob.open_handles() == 0 {
                self.purge_if_possible(&digest).await?;
                continue;
            }
            if blob.evict_mapping() {
                evicted += 1;
            }
        }
        self.stats.evictions += evicted as u64;
        if evicted > 0 {
            debug!(evicted = evicted, "evicted idle mappings");
        }
        Ok(evicted)
    }

    /// State of a blob, if present.
    pub fn state(&self, digest: &Digest) -> Option<BlobState> {
        self.blobs.get(digest).map(|b| b.state())
    }

    /// Metadata record of a blob, if present.
    pub fn record(&self, digest: &Digest) -> Option<InodeRecord> {
        self.blobs.get(digest).map(|b| *b.record())
    }

    /// Head metadata node of a committed blob.
    pub fn inode(&self, digest: &Digest) -> Option<NodeHandle> {
        self.blobs
            .get(digest)
            .and_then(|b| b.nodes().first().copied())
    }

    /// Access to a blob for inspection.
    pub fn blob(&self, digest: &Digest) -> Option<&Blob<A, W>> {
        self.blobs.get(digest)
    }

    /// Digests of all blobs held.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self.blobs.keys().copied().collect();
        digests.sort();
        digests
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if no blobs are held.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> BlobStoreStats {
        let mut stats = self.stats.clone();
        stats.blobs = self.blobs.len();
        stats.readable = self
            .blobs
            .values()
            .filter(|b| b.state() == BlobState::Readable)
            .count();
        stats.materialized = self.blobs.values().filter(|b| b.is_materialized()).count();
        stats.open_handles = self.handles.len();
        stats.live_clones = self.blobs.values().map(|b| b.live_clones()).sum();
        stats
    }
}
