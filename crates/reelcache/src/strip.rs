//! Read-only strip view consumed by the cache
//!
//! The timeline data model lives outside this crate; the cache only needs a
//! strip's identity, its timing, and how timeline frames map onto its media.
//! Strips are shared as `Arc<Strip>` and compared by handle identity, never
//! by contents. Timing fields are atomics because the editing layer moves
//! handles while cached entries still reference the strip.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use crate::key::StageMask;

/// Set alongside the stage bits when the strip overrides the session-wide
/// stored-stage selection.
const CACHE_OVERRIDE: u32 = 1 << 8;

/// What a strip plays back, as far as frame-index mapping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripSource {
    /// A still image: every timeline frame shows media frame 0.
    Image,
    /// A clip with a fixed number of media frames; frames past the end
    /// repeat the last one, so a range-extended clip reuses one Raw entry.
    Clip {
        /// Number of frames the source media provides.
        media_length: i32,
    },
    /// Generated from other strips' output; has no media of its own.
    Effect,
}

/// A timeline-placed media or effect segment, as seen by the cache.
#[derive(Debug)]
pub struct Strip {
    name: String,
    source: StripSource,
    start: AtomicI32,
    left_handle: AtomicI32,
    right_handle: AtomicI32,
    cache_flags: AtomicU32,
}

impl Strip {
    /// Create a strip handle.
    ///
    /// `start` is the timeline frame where media frame 0 sits; the handles
    /// bound the visible (trimmed) range, inclusive on both ends.
    pub fn new(
        name: impl Into<String>,
        source: StripSource,
        start: i32,
        left_handle: i32,
        right_handle: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source,
            start: AtomicI32::new(start),
            left_handle: AtomicI32::new(left_handle),
            right_handle: AtomicI32::new(right_handle),
            cache_flags: AtomicU32::new(0),
        })
    }

    /// Still-image strip covering `[left_handle, right_handle]`.
    pub fn image(name: impl Into<String>, start: i32, left: i32, right: i32) -> Arc<Self> {
        Self::new(name, StripSource::Image, start, left, right)
    }

    /// Clip strip with `media_length` source frames.
    pub fn clip(
        name: impl Into<String>,
        start: i32,
        media_length: i32,
        left: i32,
        right: i32,
    ) -> Arc<Self> {
        Self::new(name, StripSource::Clip { media_length }, start, left, right)
    }

    /// Effect strip; renders from other strips, so Raw mapping never applies.
    pub fn effect(name: impl Into<String>, start: i32, left: i32, right: i32) -> Arc<Self> {
        Self::new(name, StripSource::Effect, start, left, right)
    }

    /// Strip name, used by the disk tier and introspection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Media source kind.
    pub fn source(&self) -> StripSource {
        self.source
    }

    /// True for strips generated from other strips' output.
    pub fn is_effect(&self) -> bool {
        matches!(self.source, StripSource::Effect)
    }

    /// Timeline frame where media frame 0 sits.
    pub fn start_frame(&self) -> i32 {
        self.start.load(Ordering::Relaxed)
    }

    /// First visible timeline frame.
    pub fn left_handle(&self) -> i32 {
        self.left_handle.load(Ordering::Relaxed)
    }

    /// Last visible timeline frame.
    pub fn right_handle(&self) -> i32 {
        self.right_handle.load(Ordering::Relaxed)
    }

    /// Move the strip's media origin.
    pub fn set_start_frame(&self, frame: i32) {
        self.start.store(frame, Ordering::Relaxed);
    }

    /// Trim the left handle.
    pub fn set_left_handle(&self, frame: i32) {
        self.left_handle.store(frame, Ordering::Relaxed);
    }

    /// Trim the right handle.
    pub fn set_right_handle(&self, frame: i32) {
        self.right_handle.store(frame, Ordering::Relaxed);
    }

    /// True when `timeline_frame` lies inside the trimmed range.
    pub fn contains_frame(&self, timeline_frame: i32) -> bool {
        timeline_frame >= self.left_handle() && timeline_frame <= self.right_handle()
    }

    /// Per-strip stored-stage override, replacing the session selection when
    /// set. FinalOutput storage still follows the session regardless.
    pub fn stage_override(&self) -> Option<StageMask> {
        let flags = self.cache_flags.load(Ordering::Relaxed);
        if flags & CACHE_OVERRIDE != 0 {
            Some(StageMask::from_bits_truncate(flags))
        } else {
            None
        }
    }

    /// Set or clear the stored-stage override.
    pub fn set_stage_override(&self, stages: Option<StageMask>) {
        let flags = match stages {
            Some(mask) => mask.bits() | CACHE_OVERRIDE,
            None => 0,
        };
        self.cache_flags.store(flags, Ordering::Relaxed);
    }

    /// Which media frame the strip shows at `timeline_frame`.
    ///
    /// Only meaningful for non-effect strips; Raw-stage keys are built from
    /// this so that frames showing the same media share one entry.
    pub fn source_frame_index(&self, timeline_frame: f32) -> f32 {
        let start = self.start_frame() as f32;
        match self.source {
            StripSource::Image => 0.0,
            StripSource::Clip { media_length } => {
                let last = (media_length - 1).max(0) as f32;
                (timeline_frame - start).clamp(0.0, last)
            }
            StripSource::Effect => timeline_frame - start,
        }
    }
}
