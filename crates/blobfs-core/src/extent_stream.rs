//! Flattening of (possibly fragmented) extents into I/O runs.

use blobfs_storage::Extent;

/// One contiguous transfer between the in-memory image and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRun {
    /// First block within the in-memory image.
    pub mem_block: u64,
    /// First device block.
    pub dev_block: u64,
    /// Number of blocks.
    pub length: u64,
}

/// Iterator over the I/O runs covering the first `block_budget` blocks of
/// an extent list. Physically adjacent extents are merged into one run.
#[derive(Debug, Clone)]
pub struct ExtentStream<'a> {
    extents: &'a [Extent],
    next: usize,
    mem_block: u64,
    remaining: u64,
}

impl<'a> ExtentStream<'a> {
    /// Streams `block_budget` blocks of `extents`; the last extent used is clamped.
    pub fn new(extents: &'a [Extent], block_budget: u64) -> Self {
        Self {
            extents,
            next: 0,
            mem_block: 0,
            remaining: block_budget,
        }
    }

    /// Blocks of the budget not yet covered by a yielded run.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for ExtentStream<'_> {
    type Item = IoRun;

    fn next(&mut self) -> Option<IoRun> {
        let mut run: Option<IoRun> = None;
        while self.remaining > 0 {
            let Some(extent) = self.extents.get(self.next) else {
                break;
            };
            let take = extent.length.min(self.remaining);
            match run.as_mut() {
                None => {
                    run = Some(IoRun {
                        mem_block: self.mem_block,
                        dev_block: extent.start,
                        length: take,
                    })
                }
                Some(r) if r.dev_block + r.length == extent.start => r.length += take,
                Some(_) => break,
            }
            self.next += 1;
            self.mem_block += take;
            self.remaining -= take;
        }
        run
    }
}

/// Emits every run of [`ExtentStream`] through `emit`, stopping at the first error.
/// Returns the number of blocks streamed.
pub fn stream<E, F>(extents: &[Extent], block_budget: u64, mut emit: F) -> Result<u64, E>
where
    F: FnMut(IoRun) -> Result<(), E>,
{
    let mut streamed = 0;
    for run in ExtentStream::new(extents, block_budget) {
        streamed += run.length;
        emit(run)?;
    }
    Ok(streamed)
}

/// The prefix of `extents` covering `block_budget` blocks, last extent clamped.
pub fn clamp(extents: &[Extent], block_budget: u64) -> Vec<Extent> {
    let mut out = Vec::new();
    let mut remaining = block_budget;
    for extent in extents {
        if remaining == 0 {
            break;
        }
        let take = extent.length.min(remaining);
        out.push(Extent::new(extent.start, take));
        remaining -= take;
    }
    out
}

/// The complement of [`clamp`]: blocks of `extents` beyond the budget.
pub fn excess(extents: &[Extent], block_budget: u64) -> Vec<Extent> {
    let mut out = Vec::new();
    let mut skip = block_budget;
    for extent in extents {
        if skip >= extent.length {
            skip -= extent.length;
            continue;
        }
        out.push(Extent::new(extent.start + skip, extent.length - skip));
        skip = 0;
    }
    out
}
