//! Writeback subsystem: data streaming plus a metadata journal.
//!
//! A transaction is a batch of [`WritebackOp`]s tagged with a
//! [`TransactionTag`]. Data runs are copied out of attached source buffers
//! and written straight to the device; node record updates are then
//! appended to the metadata journal and applied to the committed node
//! table. The transaction completes only after both steps succeeded, so a
//! node record never points at blocks that were not written.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::NodeHandle;
use crate::device::BlockDevice;
use crate::error::{StorageError, StorageResult};

/// Identifies a source buffer attached to the writeback subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Logical transaction a batch of writes belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionTag(pub u64);

/// Copy `length` blocks from an attached buffer to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Source buffer.
    pub buffer: BufferId,
    /// First block within the source buffer.
    pub buffer_block: u64,
    /// First destination block on the device.
    pub device_block: u64,
    /// Number of blocks.
    pub length: u64,
}

/// One operation of a writeback transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritebackOp {
    /// Unjournaled data write.
    Data(WriteRequest),
    /// Replace the record stored in a metadata node.
    WriteNode {
        /// Target node.
        node: NodeHandle,
        /// Serialized record.
        record: Vec<u8>,
    },
    /// Clear a metadata node.
    FreeNode {
        /// Target node.
        node: NodeHandle,
    },
}

/// Writeback interface consumed by the blob core.
pub trait Writeback: Send + Sync {
    /// Block size of the underlying device.
    fn block_size(&self) -> u64;

    /// Registers a source buffer for subsequent write requests.
    fn attach(&self, buffer: Bytes) -> BufferId;

    /// Drops a previously attached buffer.
    fn detach(&self, buffer: BufferId);

    /// Executes a transaction; resolves to the journal sequence it committed at.
    fn enqueue(
        &self,
        tag: TransactionTag,
        ops: Vec<WritebackOp>,
    ) -> impl std::future::Future<Output = StorageResult<u64>> + Send;

    /// Reads `count` device blocks starting at `start`.
    fn read_blocks(
        &self,
        start: u64,
        count: u64,
    ) -> impl std::future::Future<Output = StorageResult<Vec<u8>>> + Send;

    /// Returns the committed record of a metadata node, if any.
    fn read_node(&self, node: NodeHandle) -> Option<Vec<u8>>;
}

/// Configuration for the metadata journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Maximum number of retained journal entries.
    pub max_entries: usize,
    /// Drop already-applied entries instead of failing when full.
    pub auto_checkpoint: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_entries: 4096,
            auto_checkpoint: true,
        }
    }
}

/// Metadata operation recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOp {
    /// Node record write.
    WriteNode {
        /// Target node.
        node: NodeHandle,
        /// Serialized record.
        record: Vec<u8>,
    },
    /// Node free.
    FreeNode {
        /// Target node.
        node: NodeHandle,
    },
}

/// A single entry in the metadata journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Transaction the entry belongs to.
    pub tag: TransactionTag,
    /// CRC32 of the record payload (zero for frees).
    pub checksum: u32,
    /// The operation.
    pub op: JournalOp,
}

/// Statistics for the writeback subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalStats {
    /// Transactions that completed.
    pub transactions_committed: u64,
    /// Transactions that failed.
    pub transactions_failed: u64,
    /// Journal entries appended.
    pub entries_appended: u64,
    /// Journal entries dropped by checkpointing.
    pub entries_truncated: u64,
    /// Data blocks written to the device.
    pub data_blocks_written: u64,
    /// Buffers currently attached.
    pub attached_buffers: usize,
}

struct JournalState {
    buffers: HashMap<u64, Bytes>,
    next_buffer: u64,
    entries: Vec<JournalEntry>,
    next_sequence: u64,
    committed_sequence: u64,
    nodes: HashMap<NodeHandle, Vec<u8>>,
    stats: JournalStats,
}

/// Writeback subsystem backed by a [`BlockDevice`] and an in-memory metadata journal.
pub struct JournalWriteback<D: BlockDevice> {
    config: JournalConfig,
    device: Arc<D>,
    state: Mutex<JournalState>,
}

impl<D: BlockDevice> JournalWriteback<D> {
    /// Creates a new writeback subsystem over `device`.
    pub fn new(config: JournalConfig, device: Arc<D>) -> Self {
        debug!(max_entries = config.max_entries, "creating journal writeback");
        Self {
            config,
            device,
            state: Mutex::new(JournalState {
                buffers: HashMap::new(),
                next_buffer: 1,
                entries: Vec::new(),
                next_sequence: 1,
                committed_sequence: 0,
                nodes: HashMap::new(),
                stats: JournalStats::default(),
            }),
        }
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Returns all entries with sequence >= `sequence`.
    pub fn entries_since(&self, sequence: u64) -> Vec<JournalEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.sequence >= sequence)
            .cloned()
            .collect()
    }

    /// Drops entries before `sequence`. Returns the number removed.
    pub fn truncate_before(&self, sequence: u64) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.sequence >= sequence);
        let removed = before - state.entries.len();
        state.stats.entries_truncated += removed as u64;
        if removed > 0 {
            debug!(removed = removed, sequence = sequence, "truncated journal entries");
        }
        removed
    }

    /// Last committed sequence number.
    pub fn committed_sequence(&self) -> u64 {
        self.state.lock().committed_sequence
    }

    /// Number of retained journal entries.
    pub fn total_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of nodes holding a committed record.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats.clone()
    }

    /// Checks an entry's payload against its checksum.
    pub fn verify_entry(entry: &JournalEntry) -> bool {
        match &entry.op {
            JournalOp::WriteNode { record, .. } => crc32fast::hash(record) == entry.checksum,
            JournalOp::FreeNode { .. } => entry.checksum == 0,
        }
    }

    /// Resolves data requests into owned device writes and collects metadata ops.
    fn stage(
        &self,
        ops: Vec<WritebackOp>,
    ) -> StorageResult<(Vec<(u64, Vec<u8>)>, Vec<JournalOp>)> {
        let block_size = self.device.block_size();
        let mut state = self.state.lock();
        let mut writes = Vec::new();
        let mut meta = Vec::new();

        for op in ops {
            match op {
                WritebackOp::Data(req) => {
                    let buffer = state
                        .buffers
                        .get(&req.buffer.0)
                        .ok_or(StorageError::UnknownBuffer { buffer: req.buffer.0 })?;
                    let offset = req.buffer_block * block_size;
                    let len = req.length * block_size;
                    if offset + len > buffer.len() as u64 {
                        return Err(StorageError::SourceOutOfRange {
                            buffer: req.buffer.0,
                            offset,
                            len,
                            buffer_len: buffer.len() as u64,
                        });
                    }
                    let data = buffer[offset as usize..(offset + len) as usize].to_vec();
                    writes.push((req.device_block, data));
                }
                WritebackOp::WriteNode { node, record } => {
                    meta.push(JournalOp::WriteNode { node, record })
                }
                WritebackOp::FreeNode { node } => meta.push(JournalOp::FreeNode { node }),
            }
        }

        if state.entries.len() + meta.len() > self.config.max_entries {
            if self.config.auto_checkpoint {
                let dropped = state.entries.len();
                state.entries.clear();
                state.stats.entries_truncated += dropped as u64;
                debug!(dropped = dropped, "journal checkpoint");
            } else {
                return Err(StorageError::JournalFull {
                    entries: state.entries.len(),
                });
            }
        }

        Ok((writes, meta))
    }

    fn apply(&self, tag: TransactionTag, meta: Vec<JournalOp>, data_blocks: u64) -> u64 {
        let mut state = self.state.lock();
        for op in meta {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let checksum = match &op {
                JournalOp::WriteNode { node, record } => {
                    state.nodes.insert(*node, record.clone());
                    crc32fast::hash(record)
                }
                JournalOp::FreeNode { node } => {
                    state.nodes.remove(node);
                    0
                }
            };
            state.entries.push(JournalEntry {
                sequence,
                tag,
                checksum,
                op,
            });
            state.stats.entries_appended += 1;
        }
        state.committed_sequence = state.next_sequence - 1;
        state.stats.transactions_committed += 1;
        state.stats.data_blocks_written += data_blocks;
        state.committed_sequence
    }

    fn record_failure(&self) {
        self.state.lock().stats.transactions_failed += 1;
    }
}

impl<D: BlockDevice> Writeback for JournalWriteback<D> {
    fn block_size(&self) -> u64 {
        self.device.block_size()
    }

    fn attach(&self, buffer: Bytes) -> BufferId {
        let mut state = self.state.lock();
        let id = state.next_buffer;
        state.next_buffer += 1;
        debug!(buffer = id, len = buffer.len(), "attached buffer");
        state.buffers.insert(id, buffer);
        state.stats.attached_buffers = state.buffers.len();
        BufferId(id)
    }

    fn detach(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.0);
        state.stats.attached_buffers = state.buffers.len();
    }

    async fn enqueue(&self, tag: TransactionTag, ops: Vec<WritebackOp>) -> StorageResult<u64> {
        let (writes, meta) = match self.stage(ops) {
            Ok(staged) => staged,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };

        let block_size = self.device.block_size();
        let mut data_blocks = 0;
        for (device_block, data) in writes {
            data_blocks += data.len() as u64 / block_size;
            if let Err(e) = self.device.write_blocks(device_block, data).await {
                warn!(tag = tag.0, error = %e, "writeback data write failed");
                self.record_failure();
                return Err(e);
            }
        }
        if let Err(e) = self.device.flush().await {
            self.record_failure();
            return Err(e);
        }

        let sequence = self.apply(tag, meta, data_blocks);
        debug!(
            tag = tag.0,
            sequence = sequence,
            data_blocks = data_blocks,
            "transaction committed"
        );
        Ok(sequence)
    }

    async fn read_blocks(&self, start: u64, count: u64) -> StorageResult<Vec<u8>> {
        self.device.read_blocks(start, count).await
    }

    fn read_node(&self, node: NodeHandle) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(&node).cloned()
    }
}
