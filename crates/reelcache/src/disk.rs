//! Spill-to-disk tier seam
//!
//! The cache core does not own an on-disk format. It talks to whatever tier
//! the session provides through [`DiskTier`], created lazily on first use so
//! sessions that never overflow RAM never touch the filesystem.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::FrameBuffer;
use crate::key::{CacheKey, StageMask};
use crate::strip::Strip;

/// The four operations the cache needs from a disk tier.
///
/// Implementations own their format, limits, and error handling; failures
/// degrade to `None`/no-op and never propagate. `write` must be safe to call
/// redundantly for the same key. The store never calls any of these while
/// holding its own mutex.
pub trait DiskTier: Send + Sync {
    /// Fetch the frame stored under `key`, if any.
    fn read(&self, key: &CacheKey) -> Option<Arc<FrameBuffer>>;

    /// Persist `frame` under `key`.
    fn write(&self, key: &CacheKey, frame: &Arc<FrameBuffer>);

    /// Drop stored entries for an edit to `changed_strip` affecting `strip`,
    /// following the same stage/range rules as the RAM tier.
    fn invalidate(&self, strip: &Arc<Strip>, changed_strip: &Arc<Strip>, stages: StageMask);

    /// Bring the tier's total stored bytes back under its own limit.
    fn enforce_size_limit(&self);
}

/// Builds the disk tier on first use.
///
/// Returning `None` (directory missing, permissions, disabled by config)
/// leaves the store RAM-only for that call; the provider is retried on the
/// next disk access.
pub type DiskTierProvider = Box<dyn Fn() -> Option<Arc<dyn DiskTier>> + Send + Sync>;

/// Lazily created tier handle, one per store.
pub(crate) struct DiskSlot {
    provider: Option<DiskTierProvider>,
    handle: Mutex<Option<Arc<dyn DiskTier>>>,
}

impl DiskSlot {
    pub(crate) fn new(provider: Option<DiskTierProvider>) -> Self {
        Self {
            provider,
            handle: Mutex::new(None),
        }
    }

    /// The tier handle, creating it on first use.
    pub(crate) fn get_or_create(&self) -> Option<Arc<dyn DiskTier>> {
        let provider = self.provider.as_ref()?;
        let mut handle = self.handle.lock();
        if handle.is_none() {
            *handle = provider();
        }
        handle.clone()
    }

    /// The tier handle only if a previous use already created it.
    ///
    /// Invalidation must not be the thing that first spins the tier up.
    pub(crate) fn created(&self) -> Option<Arc<dyn DiskTier>> {
        self.handle.lock().clone()
    }
}
