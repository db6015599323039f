//! Reference counting for zero-copy clones of a blob mapping.
//!
//! Every [`BlobClone`] holds a [`CloneLease`]. When the last lease drops the
//! tracker wakes tasks blocked in [`CloneTracker::wait_for_zero`] and runs
//! the registered zero-clones callback, which lets the owner tear the
//! mapping down.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

type ZeroCallback = Arc<dyn Fn() + Send + Sync>;

struct TrackerInner {
    live: AtomicUsize,
    notify: Notify,
    on_zero: Mutex<Option<ZeroCallback>>,
}

/// Counts live clones of one blob.
#[derive(Clone)]
pub struct CloneTracker {
    inner: Arc<TrackerInner>,
}

impl CloneTracker {
    /// Creates a tracker with no clones and no callback.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                live: AtomicUsize::new(0),
                notify: Notify::new(),
                on_zero: Mutex::new(None),
            }),
        }
    }

    /// Registers the callback run each time the count drops to zero.
    pub fn set_on_zero<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_zero.lock() = Some(Arc::new(callback));
    }

    /// Takes out a lease; the clone count stays raised until it drops.
    pub fn lease(&self) -> CloneLease {
        let live = self.inner.live.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(live = live, "clone lease taken");
        CloneLease {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live clones.
    pub fn live_clones(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Resolves once no clones are live.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_clones() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CloneTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloneTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloneTracker")
            .field("live", &self.live_clones())
            .finish()
    }
}

/// Keeps one clone counted for as long as it lives.
pub struct CloneLease {
    inner: Arc<TrackerInner>,
}

impl Drop for CloneLease {
    fn drop(&mut self) {
        if self.inner.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!("last clone lease released");
            self.inner.notify.notify_waiters();
            let callback = self.inner.on_zero.lock().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl fmt::Debug for CloneLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloneLease")
    }
}

/// Access rights requested for a shareable region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneRights {
    /// Read access.
    pub read: bool,
    /// Write access; never granted.
    pub write: bool,
}

impl CloneRights {
    /// Read-only access.
    pub const READ: CloneRights = CloneRights {
        read: true,
        write: false,
    };
}

/// Read-only, zero-copy view of a blob's plaintext.
pub struct BlobClone {
    data: Bytes,
    rights: CloneRights,
    lease: CloneLease,
}

impl BlobClone {
    pub(crate) fn new(data: Bytes, rights: CloneRights, lease: CloneLease) -> Self {
        Self {
            data,
            rights,
            lease,
        }
    }

    /// The rights the clone was granted.
    pub fn rights(&self) -> CloneRights {
        self.rights
    }

    /// The shared content.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Clone for BlobClone {
    fn clone(&self) -> Self {
        let lease = CloneLease {
            inner: Arc::clone(&self.lease.inner),
        };
        lease.inner.live.fetch_add(1, Ordering::AcqRel);
        Self {
            data: self.data.clone(),
            rights: self.rights,
            lease,
        }
    }
}

impl Deref for BlobClone {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for BlobClone {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for BlobClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobClone")
            .field("len", &self.data.len())
            .field("rights", &self.rights)
            .finish()
    }
}
