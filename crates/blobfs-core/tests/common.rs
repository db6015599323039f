//! Common test utilities and fixtures for blob store integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use blobfs_core::{root_of, BlobStore, BlobStoreConfig, Digest, HandleId};
use blobfs_storage::{
    AllocatorConfig, DeviceConfig, ExtentAllocator, JournalConfig, JournalWriteback,
    MemBlockDevice,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Store over in-memory collaborators.
pub type MemStore = BlobStore<ExtentAllocator, JournalWriteback<MemBlockDevice>>;

/// Test configuration with small devices for fast testing
pub struct TestConfig {
    pub total_blocks: u64,
    pub total_nodes: u32,
    pub max_extent_length: u64,
    pub store: BlobStoreConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            total_blocks: 1024,
            total_nodes: 256,
            max_extent_length: 16,
            store: BlobStoreConfig::default(),
        }
    }
}

impl TestConfig {
    pub fn build(self) -> MemStore {
        let allocator = Arc::new(ExtentAllocator::new(AllocatorConfig {
            total_blocks: self.total_blocks,
            total_nodes: self.total_nodes,
            max_extent_length: self.max_extent_length,
        }));
        let device = Arc::new(MemBlockDevice::new(DeviceConfig {
            block_size: self.store.block_size,
            block_count: self.total_blocks,
        }));
        let writeback = Arc::new(JournalWriteback::new(JournalConfig::default(), device));
        BlobStore::new(self.store, allocator, writeback).unwrap()
    }
}

pub fn new_store() -> MemStore {
    TestConfig::default().build()
}

/// Incompressible bytes, reproducible per seed.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Highly compressible bytes.
pub fn repetitive_bytes(len: usize) -> Vec<u8> {
    b"blobfs ".iter().copied().cycle().take(len).collect()
}

/// Creates and fully writes a blob in `chunk`-sized pieces. Returns its
/// digest and the still-open writer handle.
pub async fn put_chunked(store: &mut MemStore, data: &[u8], chunk: usize) -> (Digest, HandleId) {
    let digest = root_of(data);
    let handle = store.create(digest, data.len() as u64).await.unwrap();
    for piece in data.chunks(chunk.max(1)) {
        assert_eq!(store.write(handle, piece).await.unwrap(), piece.len());
    }
    (digest, handle)
}

pub async fn put(store: &mut MemStore, data: &[u8]) -> (Digest, HandleId) {
    put_chunked(store, data, 64 * 1024).await
}

/// Writes a blob, closes its writer and drops its mapping, so the next
/// access reads from the device.
pub async fn put_and_evict(store: &mut MemStore, data: &[u8]) -> Digest {
    let (digest, handle) = put(store, data).await;
    store.close(handle).await.unwrap();
    store.evict_idle().await.unwrap();
    assert!(!store.blob(&digest).unwrap().is_materialized());
    digest
}

pub async fn read_all(store: &mut MemStore, digest: &Digest) -> Vec<u8> {
    let size = store.record(digest).unwrap().content_size as usize;
    let handle = store.open(digest).unwrap();
    let mut out = vec![0u8; size];
    let n = store.read(handle, &mut out, 0).await.unwrap();
    store.close(handle).await.unwrap();
    assert_eq!(n, size);
    out
}
