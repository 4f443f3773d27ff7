//! Shared prefetch status
//!
//! The prefetch scheduler lives outside this crate. It publishes its state
//! into this object; eviction reads it to protect the frames prefetch is
//! about to need, and `cleanup` uses it to call the whole job off.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Prefetch job state shared between the scheduler and the cache.
#[derive(Debug, Default)]
pub struct PrefetchStatus {
    running: AtomicBool,
    stop_requested: AtomicBool,
    range_start: AtomicI32,
    range_end: AtomicI32,
}

impl PrefetchStatus {
    /// Create an idle status object.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True while the scheduler is rendering ahead.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The frame range prefetch is working through, inclusive.
    ///
    /// Only meaningful while [`PrefetchStatus::is_running`] is true.
    pub fn active_range(&self) -> (i32, i32) {
        (
            self.range_start.load(Ordering::Acquire),
            self.range_end.load(Ordering::Acquire),
        )
    }

    /// Scheduler: mark the job started over `[start, end]`.
    pub fn begin(&self, start: i32, end: i32) {
        self.stop_requested.store(false, Ordering::Release);
        self.set_range(start, end);
        self.running.store(true, Ordering::Release);
    }

    /// Scheduler: move the active range as work progresses.
    pub fn set_range(&self, start: i32, end: i32) {
        self.range_start.store(start, Ordering::Release);
        self.range_end.store(end, Ordering::Release);
    }

    /// Scheduler: mark the job finished.
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Call the job off.
    ///
    /// Reports not-running immediately; the scheduler is expected to poll
    /// [`PrefetchStatus::is_stop_requested`] and wind down.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    /// Scheduler: has anyone asked the job to stop?
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}
