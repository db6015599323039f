//! Extent allocator for device blocks and metadata node slots.
//!
//! Space is handed out in two phases. A writer first *reserves* blocks and
//! nodes, which removes them from the free pool without making them
//! persistent. The reservation is then either *committed* (the blocks and
//! nodes become allocated) or *released* back to the free pool. Committed
//! space is returned with [`Allocator::free_extents`] and
//! [`Allocator::free_node`].

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{total_blocks, Extent, NodeHandle};
use crate::error::{StorageError, StorageResult};

/// Space management interface consumed by the blob core.
pub trait Allocator: Send + Sync {
    /// Reserves `count` blocks, returned as an ordered list of extents.
    fn reserve_blocks(&self, count: u64) -> StorageResult<Vec<Extent>>;

    /// Reserves `count` metadata node slots.
    fn reserve_nodes(&self, count: usize) -> StorageResult<Vec<NodeHandle>>;

    /// Turns reserved extents and nodes into allocated ones.
    fn commit(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()>;

    /// Returns reserved (never committed) extents and nodes to the free pool.
    fn release(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()>;

    /// Frees a committed node.
    fn free_node(&self, node: NodeHandle) -> StorageResult<()>;

    /// Frees committed extents.
    fn free_extents(&self, extents: &[Extent]) -> StorageResult<()>;

    /// Returns a snapshot of the allocator's counters.
    fn stats(&self) -> AllocatorStats;
}

/// Configuration for the extent allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Number of data blocks managed.
    pub total_blocks: u64,
    /// Number of metadata node slots managed.
    pub total_nodes: u32,
    /// Longest extent handed out; longer free runs are split.
    pub max_extent_length: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_blocks: 65536,
            total_nodes: 4096,
            max_extent_length: u16::MAX as u64,
        }
    }
}

/// Statistics about the allocator's state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Total blocks managed.
    pub total_blocks: u64,
    /// Blocks neither reserved nor allocated.
    pub free_blocks: u64,
    /// Blocks held by outstanding reservations.
    pub reserved_blocks: u64,
    /// Blocks committed.
    pub allocated_blocks: u64,
    /// Number of distinct free runs (a fragmentation indicator).
    pub free_runs: usize,
    /// Total node slots managed.
    pub total_nodes: u32,
    /// Free node slots.
    pub free_nodes: usize,
    /// Reserved node slots.
    pub reserved_nodes: usize,
    /// Committed node slots.
    pub allocated_nodes: usize,
    /// Reservations that succeeded.
    pub reservations: u64,
    /// Reservations that failed for lack of space or nodes.
    pub failed_reservations: u64,
}

/// First-fit extent allocator with coalescing free-run map.
/// Thread-safe via internal mutex.
pub struct ExtentAllocator {
    inner: Mutex<AllocatorInner>,
}

struct AllocatorInner {
    config: AllocatorConfig,
    /// start -> length of every free run; runs never touch or overlap.
    free_runs: BTreeMap<u64, u64>,
    free_blocks: u64,
    reserved_blocks: u64,
    allocated_blocks: u64,
    free_nodes: BTreeSet<u32>,
    reserved_nodes: BTreeSet<u32>,
    allocated_nodes: BTreeSet<u32>,
    reservations: u64,
    failed_reservations: u64,
}

impl AllocatorInner {
    fn new(config: AllocatorConfig) -> Self {
        let mut free_runs = BTreeMap::new();
        if config.total_blocks > 0 {
            free_runs.insert(0, config.total_blocks);
        }
        Self {
            free_runs,
            free_blocks: config.total_blocks,
            reserved_blocks: 0,
            allocated_blocks: 0,
            free_nodes: (0..config.total_nodes).collect(),
            reserved_nodes: BTreeSet::new(),
            allocated_nodes: BTreeSet::new(),
            reservations: 0,
            failed_reservations: 0,
            config,
        }
    }

    fn reserve_blocks(&mut self, count: u64) -> StorageResult<Vec<Extent>> {
        if count > self.free_blocks {
            self.failed_reservations += 1;
            return Err(StorageError::OutOfSpace {
                requested: count,
                available: self.free_blocks,
            });
        }

        let mut extents = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let Some((&start, &length)) = self.free_runs.iter().next() else {
                // free_blocks said there was room; the map disagrees.
                break;
            };
            let take = remaining.min(length).min(self.config.max_extent_length);
            self.free_runs.remove(&start);
            if take < length {
                self.free_runs.insert(start + take, length - take);
            }
            extents.push(Extent::new(start, take));
            remaining -= take;
        }

        if remaining > 0 {
            for extent in &extents {
                self.insert_free(*extent);
            }
            self.failed_reservations += 1;
            return Err(StorageError::OutOfSpace {
                requested: count,
                available: count - remaining,
            });
        }

        self.free_blocks -= count;
        self.reserved_blocks += count;
        self.reservations += 1;

        debug!(
            count = count,
            extents = extents.len(),
            free_blocks = self.free_blocks,
            "reserved blocks"
        );
        Ok(extents)
    }

    fn reserve_nodes(&mut self, count: usize) -> StorageResult<Vec<NodeHandle>> {
        if count > self.free_nodes.len() {
            self.failed_reservations += 1;
            return Err(StorageError::OutOfNodes {
                requested: count,
                available: self.free_nodes.len(),
            });
        }
        let picked: Vec<u32> = self.free_nodes.iter().take(count).copied().collect();
        for idx in &picked {
            self.free_nodes.remove(idx);
            self.reserved_nodes.insert(*idx);
        }
        debug!(count = count, free_nodes = self.free_nodes.len(), "reserved nodes");
        Ok(picked.into_iter().map(NodeHandle).collect())
    }

    /// Inserts a run into the free map, merging with its neighbours.
    fn insert_free(&mut self, extent: Extent) {
        if extent.is_empty() {
            return;
        }
        let mut start = extent.start;
        let mut length = extent.length;

        if let Some((&prev_start, &prev_len)) = self.free_runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                length += prev_len;
            }
        }
        if let Some(&next_len) = self.free_runs.get(&(start + length)) {
            self.free_runs.remove(&(start + length));
            length += next_len;
        }
        self.free_runs.insert(start, length);
    }

    fn check_not_free(&self, extent: &Extent) -> StorageResult<()> {
        if extent.end() > self.config.total_blocks {
            return Err(StorageError::InvalidExtent {
                extent: *extent,
                reason: "beyond end of device",
            });
        }
        let candidate = self
            .free_runs
            .range(..extent.end())
            .next_back()
            .map(|(&s, &l)| Extent::new(s, l));
        if let Some(run) = candidate {
            if run.overlaps(extent) {
                return Err(StorageError::InvalidExtent {
                    extent: *extent,
                    reason: "overlaps free space",
                });
            }
        }
        Ok(())
    }

    fn commit(&mut self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
        for node in nodes {
            if !self.reserved_nodes.contains(&node.0) {
                return Err(StorageError::InvalidNode {
                    node: *node,
                    reason: "not reserved",
                });
            }
        }
        for extent in extents {
            self.check_not_free(extent)?;
        }
        let blocks = total_blocks(extents);
        if blocks > self.reserved_blocks {
            return Err(StorageError::InvalidExtent {
                extent: extents[0],
                reason: "more blocks committed than reserved",
            });
        }
        for node in nodes {
            self.reserved_nodes.remove(&node.0);
            self.allocated_nodes.insert(node.0);
        }
        self.reserved_blocks -= blocks;
        self.allocated_blocks += blocks;
        debug!(blocks = blocks, nodes = nodes.len(), "committed reservation");
        Ok(())
    }

    fn release(&mut self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
        for extent in extents {
            self.check_not_free(extent)?;
        }
        for node in nodes {
            if !self.reserved_nodes.remove(&node.0) {
                return Err(StorageError::InvalidNode {
                    node: *node,
                    reason: "not reserved",
                });
            }
            self.free_nodes.insert(node.0);
        }
        let blocks = total_blocks(extents);
        for extent in extents {
            self.insert_free(*extent);
        }
        self.reserved_blocks = self.reserved_blocks.saturating_sub(blocks);
        self.free_blocks += blocks;
        debug!(blocks = blocks, nodes = nodes.len(), "released reservation");
        Ok(())
    }

    fn free_node(&mut self, node: NodeHandle) -> StorageResult<()> {
        if !self.allocated_nodes.remove(&node.0) {
            return Err(StorageError::InvalidNode {
                node,
                reason: "not allocated",
            });
        }
        self.free_nodes.insert(node.0);
        debug!(node = %node, "freed node");
        Ok(())
    }

    fn free_extents(&mut self, extents: &[Extent]) -> StorageResult<()> {
        for extent in extents {
            self.check_not_free(extent)?;
        }
        let blocks = total_blocks(extents);
        for extent in extents {
            self.insert_free(*extent);
        }
        self.allocated_blocks = self.allocated_blocks.saturating_sub(blocks);
        self.free_blocks += blocks;
        debug!(blocks = blocks, extents = extents.len(), "freed extents");
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total_blocks: self.config.total_blocks,
            free_blocks: self.free_blocks,
            reserved_blocks: self.reserved_blocks,
            allocated_blocks: self.allocated_blocks,
            free_runs: self.free_runs.len(),
            total_nodes: self.config.total_nodes,
            free_nodes: self.free_nodes.len(),
            reserved_nodes: self.reserved_nodes.len(),
            allocated_nodes: self.allocated_nodes.len(),
            reservations: self.reservations,
            failed_reservations: self.failed_reservations,
        }
    }
}

impl ExtentAllocator {
    /// Create a new allocator with every block and node free.
    pub fn new(config: AllocatorConfig) -> Self {
        debug!(
            total_blocks = config.total_blocks,
            total_nodes = config.total_nodes,
            "creating extent allocator"
        );
        Self {
            inner: Mutex::new(AllocatorInner::new(config)),
        }
    }

    /// Returns the allocator configuration.
    pub fn config(&self) -> AllocatorConfig {
        self.inner.lock().config.clone()
    }
}

impl Allocator for ExtentAllocator {
    fn reserve_blocks(&self, count: u64) -> StorageResult<Vec<Extent>> {
        self.inner.lock().reserve_blocks(count)
    }

    fn reserve_nodes(&self, count: usize) -> StorageResult<Vec<NodeHandle>> {
        self.inner.lock().reserve_nodes(count)
    }

    fn commit(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
        self.inner.lock().commit(extents, nodes)
    }

    fn release(&self, extents: &[Extent], nodes: &[NodeHandle]) -> StorageResult<()> {
        self.inner.lock().release(extents, nodes)
    }

    fn free_node(&self, node: NodeHandle) -> StorageResult<()> {
        self.inner.lock().free_node(node)
    }

    fn free_extents(&self, extents: &[Extent]) -> StorageResult<()> {
        self.inner.lock().free_extents(extents)
    }

    fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }
}
