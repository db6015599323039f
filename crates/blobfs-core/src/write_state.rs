//! Staging state of an in-progress blob write.

use blobfs_storage::{Extent, NodeHandle};
use tracing::{debug, warn};

use crate::compression::{Codec, CompressionAlgorithm, Compressor};

/// Everything a blob owns between reservation and commit.
pub struct BlobWriteState {
    /// Plaintext bytes consumed so far.
    pub bytes_written: u64,
    /// Plaintext length being written.
    pub content_size: u64,
    /// Reserved extents, in stream order.
    pub extents: Vec<Extent>,
    /// Reserved metadata nodes.
    pub nodes: Vec<NodeHandle>,
    compressor: Option<Compressor>,
    min_savings: u64,
}

impl BlobWriteState {
    /// Creates the state for a reservation.
    ///
    /// A compressor is started only when the blob is big enough that
    /// compression could save `min_savings` bytes.
    pub fn new(
        content_size: u64,
        extents: Vec<Extent>,
        nodes: Vec<NodeHandle>,
        algorithm: CompressionAlgorithm,
        min_savings: u64,
    ) -> Self {
        let compressor = if content_size >= min_savings {
            Compressor::new(algorithm).unwrap_or_else(|e| {
                warn!(error = %e, "compressor unavailable, storing plaintext");
                None
            })
        } else {
            None
        };
        Self {
            bytes_written: 0,
            content_size,
            extents,
            nodes,
            compressor,
            min_savings,
        }
    }

    /// Plaintext bytes still expected.
    pub fn remaining(&self) -> u64 {
        self.content_size - self.bytes_written
    }

    /// True once every byte has been consumed.
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.content_size
    }

    /// The compressor, while compression is still worthwhile.
    pub fn compressor(&self) -> Option<&Compressor> {
        self.compressor.as_ref()
    }

    /// Largest compressed payload still worth keeping.
    fn budget(&self) -> u64 {
        self.content_size.saturating_sub(self.min_savings)
    }

    /// Records `data` as written and feeds it to the compressor.
    ///
    /// The compressor is dropped on error or once its output can no longer
    /// fit the savings budget; the blob then stores plaintext.
    pub fn feed(&mut self, data: &[u8]) {
        self.bytes_written += data.len() as u64;
        let budget = self.budget();
        let keep = match self.compressor.as_mut() {
            None => return,
            Some(c) => match c.update(data) {
                Err(e) => {
                    warn!(error = %e, "compression failed, storing plaintext");
                    false
                }
                Ok(()) if c.size() as u64 > budget => {
                    debug!(size = c.size(), budget = budget, "compression not worthwhile");
                    false
                }
                Ok(()) => true,
            },
        };
        if !keep {
            self.compressor = None;
        }
    }

    /// Finishes compression; returns the payload if it is still within budget.
    pub fn take_payload(&mut self) -> Option<(CompressionAlgorithm, Vec<u8>)> {
        let mut c = self.compressor.take()?;
        if let Err(e) = c.finish() {
            warn!(error = %e, "compression finish failed, storing plaintext");
            return None;
        }
        if c.size() as u64 > self.budget() {
            debug!(size = c.size(), budget = self.budget(), "compressed payload over budget");
            return None;
        }
        let algorithm = c.algorithm();
        match c.into_payload() {
            Ok(payload) => Some((algorithm, payload)),
            Err(e) => {
                warn!(error = %e, "compressed payload unavailable");
                None
            }
        }
    }
}
