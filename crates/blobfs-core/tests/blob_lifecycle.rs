//! Integration tests for the blob lifecycle over in-memory collaborators.
//!
//! These tests drive a store end to end: reservation, chunked writes,
//! commit through the journal, eviction and re-materialization from the
//! device, sharing, corruption handling and purge.

mod common;

use blobfs_core::{
    root_of, tree_len, BlobError, BlobState, BlobStoreConfig, CloneRights, CompressionAlgorithm,
    CompressionFlag, ExtentStream, VerifyError, NODE_SIZE,
};
use blobfs_storage::{blocks_for_bytes, Allocator, BlockDevice, Writeback};
use common::{
    new_store, put, put_and_evict, put_chunked, random_bytes, read_all, repetitive_bytes,
    TestConfig,
};

const BLOCK: u64 = 4096;

#[tokio::test]
async fn test_round_trip_sizes() {
    let mut store = new_store();
    for (i, len) in [1usize, 10, 4095, 4096, 4097, 8192, 100_000].into_iter().enumerate() {
        let data = random_bytes(len, i as u64);
        let (digest, handle) = put_chunked(&mut store, &data, 3000).await;
        assert_eq!(store.state(&digest), Some(BlobState::Readable));
        store.close(handle).await.unwrap();
        assert_eq!(read_all(&mut store, &digest).await, data);
    }
}

#[tokio::test]
async fn test_digest_identity() {
    let mut store = new_store();
    let data = random_bytes(6000, 1);
    let mut wrong = data.clone();
    wrong[5999] ^= 1;

    let digest = root_of(&data);
    let handle = store.create(digest, wrong.len() as u64).await.unwrap();
    let err = store.write(handle, &wrong).await.unwrap_err();
    assert!(matches!(err, BlobError::DataIntegrity { .. }));
    assert_eq!(store.state(&digest), Some(BlobState::Error));

    let mut buf = vec![0u8; 10];
    assert!(matches!(
        store.read(handle, &mut buf, 0).await,
        Err(BlobError::DataIntegrity { .. })
    ));
    let stats = store.allocator().stats();
    assert_eq!(stats.reserved_blocks, 0);
    assert_eq!(stats.allocated_blocks, 0);
}

#[tokio::test]
async fn test_compression_transparency_after_eviction() {
    for compression in [
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd { level: 3 },
        CompressionAlgorithm::None,
    ] {
        let mut store = TestConfig {
            store: BlobStoreConfig {
                compression,
                ..Default::default()
            },
            ..Default::default()
        }
        .build();

        let compressible = repetitive_bytes(200_000);
        let incompressible = random_bytes(50_000, 9);
        let a = put_and_evict(&mut store, &compressible).await;
        let b = put_and_evict(&mut store, &incompressible).await;

        let expected = CompressionFlag::from_algorithm(compression);
        assert_eq!(store.record(&a).unwrap().flags, expected);
        assert_eq!(store.record(&b).unwrap().flags, CompressionFlag::None);
        assert_eq!(read_all(&mut store, &a).await, compressible);
        assert_eq!(read_all(&mut store, &b).await, incompressible);
        assert!(store.blob(&a).unwrap().is_verified());
    }
}

#[tokio::test]
async fn test_idempotent_read() {
    let mut store = new_store();
    let data = random_bytes(30_000, 2);
    let (digest, handle) = put(&mut store, &data).await;

    let mut first = vec![0u8; 7000];
    let mut second = vec![0u8; 7000];
    assert_eq!(store.read(handle, &mut first, 12_345).await.unwrap(), 7000);
    assert_eq!(store.read(handle, &mut second, 12_345).await.unwrap(), 7000);
    assert_eq!(first, second);
    assert_eq!(&first[..], &data[12_345..19_345]);

    // Reads past the end are clamped.
    let mut tail = vec![0u8; 100];
    assert_eq!(store.read(handle, &mut tail, 29_950).await.unwrap(), 50);
    assert_eq!(store.read(handle, &mut tail, 30_000).await.unwrap(), 0);
    assert_eq!(store.read(handle, &mut tail, 99_999).await.unwrap(), 0);
    assert_eq!(store.state(&digest), Some(BlobState::Readable));
}

#[tokio::test]
async fn test_zero_length_blob() {
    let mut store = new_store();
    let digest = root_of(b"");
    let handle = store.create(digest, 0).await.unwrap();
    assert_eq!(store.state(&digest), Some(BlobState::Readable));

    let record = store.record(&digest).unwrap();
    assert_eq!(record.content_size, 0);
    assert_eq!(record.block_count, 0);
    assert_eq!(record.flags, CompressionFlag::None);

    let stats = store.allocator().stats();
    assert_eq!(stats.allocated_nodes, 1);
    assert_eq!(stats.allocated_blocks, 0);

    let mut buf = [0u8; 16];
    assert_eq!(store.read(handle, &mut buf, 0).await.unwrap(), 0);
    assert!(matches!(
        store.get_shareable_region(handle, CloneRights::READ).await,
        Err(BlobError::Clone { .. })
    ));
    store.verify(&digest).await.unwrap();
    assert!(store.writeback().read_node(store.inode(&digest).unwrap()).is_some());
}

#[tokio::test]
async fn test_zero_length_blob_with_wrong_name() {
    let mut store = new_store();
    let digest = root_of(b"not empty");
    assert!(matches!(
        store.create(digest, 0).await,
        Err(BlobError::DataIntegrity { .. })
    ));
    assert!(store.state(&digest).is_none());
    assert_eq!(store.allocator().stats().allocated_nodes, 0);
}

#[tokio::test]
async fn test_purge_safety() {
    let mut store = new_store();
    let data = random_bytes(20_000, 3);
    let (digest, writer) = put(&mut store, &data).await;
    let reader = store.open(&digest).unwrap();
    let clone = store
        .get_shareable_region(reader, CloneRights::READ)
        .await
        .unwrap();

    store.mark_deletable(&digest).unwrap();
    assert!(!store.try_purge(&digest).await.unwrap());
    store.close(writer).await.unwrap();
    store.close(reader).await.unwrap();
    // The clone still pins the blob.
    assert!(!store.try_purge(&digest).await.unwrap());
    assert_eq!(store.state(&digest), Some(BlobState::Readable));
    assert_eq!(&*clone, &data[..]);

    let inode = store.inode(&digest).unwrap();
    drop(clone);
    assert!(store.try_purge(&digest).await.unwrap());
    assert!(store.state(&digest).is_none());
    assert!(store.writeback().read_node(inode).is_none());

    let stats = store.allocator().stats();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.allocated_nodes, 0);
    assert_eq!(stats.free_blocks, stats.total_blocks);
}

#[tokio::test]
async fn test_deletable_purged_when_last_clone_goes_idle() {
    let mut store = new_store();
    let data = random_bytes(9000, 4);
    let (digest, writer) = put(&mut store, &data).await;
    let clone = store
        .get_shareable_region(writer, CloneRights::READ)
        .await
        .unwrap();
    store.mark_deletable(&digest).unwrap();
    store.close(writer).await.unwrap();
    assert_eq!(store.state(&digest), Some(BlobState::Readable));

    drop(clone);
    store.evict_idle().await.unwrap();
    assert!(store.state(&digest).is_none());
}

#[tokio::test]
async fn test_repetitive_5000_bytes_stored_compressed() {
    let mut store = new_store();
    let data = repetitive_bytes(5000);
    let (digest, handle) = put(&mut store, &data).await;

    let record = store.record(&digest).unwrap();
    let merkle_blocks = blocks_for_bytes(tree_len(5000), BLOCK);
    let uncompressed = merkle_blocks + blocks_for_bytes(5000, BLOCK);
    assert_eq!(record.flags, CompressionFlag::Zstd);
    assert!((record.block_count as u64) < uncompressed);

    let mut out = vec![0u8; 5000];
    assert_eq!(store.read(handle, &mut out, 0).await.unwrap(), 5000);
    assert_eq!(out, data);
}

#[tokio::test]
async fn test_random_10_bytes_stored_plain() {
    let mut store = new_store();
    let data = random_bytes(10, 5);
    let (digest, _) = put(&mut store, &data).await;

    let record = store.record(&digest).unwrap();
    assert_eq!(record.flags, CompressionFlag::None);
    let merkle_blocks = blocks_for_bytes(tree_len(10), BLOCK);
    assert_eq!(record.block_count as u64, merkle_blocks + 1);
    assert_eq!(read_all(&mut store, &digest).await, data);
}

#[tokio::test]
async fn test_write_failure_releases_reservation() {
    let mut store = new_store();
    let data = random_bytes(12_000, 6);
    let digest = root_of(&data);
    let handle = store.create(digest, data.len() as u64).await.unwrap();
    assert!(store.allocator().stats().reserved_blocks > 0);

    store.writeback().device().set_fail_writes(true);
    let err = store.write(handle, &data).await.unwrap_err();
    assert!(matches!(err, BlobError::Write(_)));
    assert_eq!(store.state(&digest), Some(BlobState::Error));

    let stats = store.allocator().stats();
    assert_eq!(stats.reserved_blocks, 0);
    assert_eq!(stats.reserved_nodes, 0);
    assert_eq!(stats.allocated_blocks, 0);

    // A failed blob is not resumable, only removable.
    assert!(matches!(
        store.write(handle, &data).await,
        Err(BlobError::BadState { .. })
    ));
    store.writeback().device().set_fail_writes(false);
    store.mark_deletable(&digest).unwrap();
    store.close(handle).await.unwrap();
    assert!(store.state(&digest).is_none());
}

#[tokio::test]
async fn test_corrupt_device_block_detected() {
    let mut store = new_store();
    let data = random_bytes(20_000, 7);
    let digest = put_and_evict(&mut store, &data).await;

    let extents = store.blob(&digest).unwrap().extents().to_vec();
    let last = extents.last().unwrap();
    store
        .writeback()
        .device()
        .corrupt_block(last.end() - 1, 17)
        .await;

    let handle = store.open(&digest).unwrap();
    let mut buf = vec![0u8; 100];
    assert!(matches!(
        store.read(handle, &mut buf, 0).await,
        Err(BlobError::DataIntegrity { .. })
    ));
    assert_eq!(store.state(&digest), Some(BlobState::Error));
    // Never served afterwards.
    assert!(matches!(
        store.read(handle, &mut buf, 0).await,
        Err(BlobError::DataIntegrity { .. })
    ));
}

#[tokio::test]
async fn test_corrupt_compressed_payload_detected() {
    let mut store = new_store();
    let data = repetitive_bytes(100_000);
    let digest = put_and_evict(&mut store, &data).await;
    assert_eq!(store.record(&digest).unwrap().flags, CompressionFlag::Zstd);

    // The merkle tree fills the first block; byte 9 is inside the frame magic.
    let extents = store.blob(&digest).unwrap().extents().to_vec();
    let merkle_blocks = tree_len(100_000) / BLOCK;
    let payload_block = ExtentStream::new(&extents, merkle_blocks + 1)
        .last()
        .map(|run| run.dev_block + run.length - 1)
        .unwrap();
    store
        .writeback()
        .device()
        .corrupt_block(payload_block, 9)
        .await;

    let handle = store.open(&digest).unwrap();
    let mut buf = vec![0u8; 10];
    let err = store.read(handle, &mut buf, 0).await.unwrap_err();
    assert!(err.is_integrity());
}

fn uncompressed_store() -> common::MemStore {
    TestConfig {
        store: BlobStoreConfig {
            compression: CompressionAlgorithm::None,
            ..Default::default()
        },
        ..Default::default()
    }
    .build()
}

#[tokio::test]
async fn test_verify_reads_device_not_mapping() {
    let mut store = uncompressed_store();
    let data = random_bytes(3 * NODE_SIZE, 8);
    let (digest, writer) = put(&mut store, &data).await;
    store.verify(&digest).await.unwrap();
    assert!(store.blob(&digest).unwrap().is_materialized());

    let extents = store.blob(&digest).unwrap().extents().to_vec();
    store
        .writeback()
        .device()
        .corrupt_block(extents.last().unwrap().end() - 1, 0)
        .await;

    // The held mapping was verified at commit and still reads back.
    let mut buf = vec![0u8; data.len()];
    assert_eq!(store.read(writer, &mut buf, 0).await.unwrap(), data.len());
    assert_eq!(buf, data);

    assert!(matches!(
        store.verify(&digest).await,
        Err(BlobError::Verify(_))
    ));
    assert_eq!(store.state(&digest), Some(BlobState::Error));
    assert!(matches!(
        store.read(writer, &mut buf, 0).await,
        Err(BlobError::DataIntegrity { .. })
    ));
}

#[tokio::test]
async fn test_verify_after_eviction_leaves_mapping_unloaded() {
    let mut store = uncompressed_store();
    let data = random_bytes(3 * NODE_SIZE, 9);
    let digest = put_and_evict(&mut store, &data).await;
    store.verify(&digest).await.unwrap();
    assert!(!store.blob(&digest).unwrap().is_materialized());

    let extents = store.blob(&digest).unwrap().extents().to_vec();
    store
        .writeback()
        .device()
        .corrupt_block(extents.last().unwrap().end() - 1, 0)
        .await;
    assert!(matches!(
        store.verify(&digest).await,
        Err(BlobError::Verify(VerifyError::NodeMismatch { .. }))
    ));
    assert_eq!(store.state(&digest), Some(BlobState::Error));
    assert!(read_err(&mut store, &digest).await.is_integrity());
}

#[tokio::test]
async fn test_verify_undecodable_payload() {
    let mut store = new_store();
    let data = repetitive_bytes(100_000);
    let digest = put_and_evict(&mut store, &data).await;

    let extents = store.blob(&digest).unwrap().extents().to_vec();
    let merkle_blocks = tree_len(100_000) / BLOCK;
    let payload_block = ExtentStream::new(&extents, merkle_blocks + 1)
        .last()
        .map(|run| run.dev_block + run.length - 1)
        .unwrap();
    store
        .writeback()
        .device()
        .corrupt_block(payload_block, 9)
        .await;

    assert!(matches!(
        store.verify(&digest).await,
        Err(BlobError::Verify(VerifyError::Undecodable { .. }))
    ));
    assert!(matches!(
        read_err(&mut store, &digest).await,
        BlobError::DataIntegrity { .. }
    ));
}

async fn read_err(store: &mut common::MemStore, digest: &blobfs_core::Digest) -> BlobError {
    let handle = store.open(digest).unwrap();
    let mut buf = vec![0u8; 16];
    let err = store.read(handle, &mut buf, 0).await.unwrap_err();
    store.close(handle).await.unwrap();
    err
}

#[tokio::test]
async fn test_fragmented_extents_round_trip() {
    let mut store = TestConfig {
        max_extent_length: 1,
        ..Default::default()
    }
    .build();
    let data = random_bytes(40_000, 10);
    let digest = put_and_evict(&mut store, &data).await;

    let blob = store.blob(&digest).unwrap();
    // One merkle block plus ten data blocks, one block per extent.
    assert_eq!(blob.extents().len(), 11);
    assert_eq!(blob.nodes().len(), 3);
    assert_eq!(read_all(&mut store, &digest).await, data);
}

#[tokio::test]
async fn test_load_fragmented_blob_from_node_table() {
    let mut store = TestConfig {
        max_extent_length: 2,
        ..Default::default()
    }
    .build();
    let data = random_bytes(60_000, 11);
    let (digest, writer) = put(&mut store, &data).await;
    store.close(writer).await.unwrap();
    let inode = store.inode(&digest).unwrap();

    let mut reopened = blobfs_core::BlobStore::new(
        BlobStoreConfig::default(),
        std::sync::Arc::clone(store.allocator()),
        std::sync::Arc::clone(store.writeback()),
    )
    .unwrap();
    assert_eq!(reopened.load(inode).unwrap(), digest);
    assert_eq!(reopened.record(&digest), store.record(&digest));
    assert_eq!(
        reopened.blob(&digest).unwrap().extents(),
        store.blob(&digest).unwrap().extents()
    );
    assert_eq!(read_all(&mut reopened, &digest).await, data);
}

#[tokio::test]
async fn test_allocation_failure_leaves_nothing() {
    let mut store = TestConfig {
        total_blocks: 8,
        ..Default::default()
    }
    .build();
    let data = random_bytes(100_000, 12);
    let digest = root_of(&data);
    assert!(matches!(
        store.create(digest, data.len() as u64).await,
        Err(BlobError::Alloc(_))
    ));
    assert!(store.state(&digest).is_none());
    assert_eq!(store.allocator().stats().free_blocks, 8);
}

#[tokio::test]
async fn test_clone_is_zero_copy() {
    let mut store = new_store();
    let data = random_bytes(10_000, 13);
    let (_, handle) = put(&mut store, &data).await;
    let a = store
        .get_shareable_region(handle, CloneRights::READ)
        .await
        .unwrap();
    let b = store
        .get_shareable_region(handle, CloneRights::READ)
        .await
        .unwrap();
    assert_eq!(a.as_ptr(), b.as_ptr());
    assert_eq!(a.len(), data.len());
    assert_eq!(store.stats().live_clones, 2);
}

#[tokio::test]
async fn test_device_io_accounting() {
    let mut store = new_store();
    let data = random_bytes(5 * BLOCK as usize, 14);
    let digest = put_and_evict(&mut store, &data).await;
    let before = store.writeback().device().stats();
    read_all(&mut store, &digest).await;
    let after = store.writeback().device().stats();
    let expected = store.record(&digest).unwrap().block_count as u64 * BLOCK;
    assert_eq!(after.bytes_read - before.bytes_read, expected);
}
