//! Image payloads and the byte budget they are charged against

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Session-wide image memory accounting.
///
/// Every [`FrameBuffer`] charges its payload size here when allocated and
/// releases it when the last reference is dropped. The cache consults
/// [`MemoryBudget::is_over_budget`] to drive eviction; it never frees memory
/// itself, it only drops references.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: AtomicUsize,
    in_use: AtomicUsize,
}

impl MemoryBudget {
    /// Create a budget with the given byte limit.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Bytes currently held by live frame buffers.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Configured byte limit.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the byte limit.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// True when usage exceeds the limit. Exactly at the limit is not over.
    pub fn is_over_budget(&self) -> bool {
        self.bytes_in_use() > self.limit()
    }

    fn charge(&self, bytes: usize) {
        self.in_use.fetch_add(bytes, Ordering::Relaxed);
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// A decoded image buffer.
///
/// Shared as `Arc<FrameBuffer>`: the cache keeps one reference per entry and
/// every successful lookup clones one more for the caller, so a buffer's
/// bytes return to the budget only when the last holder lets go.
#[derive(Debug)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
    budget: Arc<MemoryBudget>,
}

impl FrameBuffer {
    /// Allocate a buffer and charge its payload to `budget`.
    ///
    /// Allocation always succeeds; going over budget is the cache's problem,
    /// not the producer's.
    pub fn alloc(budget: &Arc<MemoryBudget>, width: u32, height: u32, data: Vec<u8>) -> Self {
        budget.charge(data.len());
        Self {
            width,
            height,
            data,
            budget: Arc::clone(budget),
        }
    }

    /// Buffer width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload size in bytes, as charged to the budget.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.budget.release(self.data.len());
    }
}
