//! Deterministic stand-in for the render pipeline
//!
//! Frames are flat fills derived from the strip name and the media frame
//! being shown, so any frame served by the cache can be checked against what
//! a fresh render would have produced.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reelcache::{CacheStage, FrameBuffer, FrameCache, RenderContext, Strip};

/// How a requested frame was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    /// The final frame came straight from the cache.
    CachedFinal,
    /// The raw decode was cached; only the finishing work ran.
    CachedRaw,
    /// Everything rendered from scratch.
    Cold,
}

/// Renders flat-fill frames with an optional simulated decode cost.
pub struct Renderer {
    width: u32,
    height: u32,
    cost: Duration,
}

impl Renderer {
    /// Renderer producing `width` x `height` RGBA frames, spending `cost_us`
    /// microseconds per raw decode.
    pub fn new(width: u32, height: u32, cost_us: u64) -> Self {
        Self {
            width,
            height,
            cost: Duration::from_micros(cost_us),
        }
    }

    /// Payload size of one rendered frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Decode the media frame `strip` shows at `timeline_frame`.
    pub fn render_raw(&self, cache: &FrameCache, strip: &Arc<Strip>, timeline_frame: i32) -> Arc<FrameBuffer> {
        if !self.cost.is_zero() {
            thread::sleep(self.cost);
        }
        let fill = expected_raw_fill(strip, timeline_frame);
        Arc::new(FrameBuffer::alloc(
            cache.budget(),
            self.width,
            self.height,
            vec![fill; self.frame_bytes()],
        ))
    }

    /// Finish a raw decode into the frame playback shows.
    pub fn render_final(&self, cache: &FrameCache, raw: &Arc<FrameBuffer>) -> Arc<FrameBuffer> {
        let fill = raw.data().first().copied().unwrap_or(0).wrapping_add(1);
        Arc::new(FrameBuffer::alloc(
            cache.budget(),
            self.width,
            self.height,
            vec![fill; self.frame_bytes()],
        ))
    }

    /// Produce the final frame for `timeline_frame` the way the pipeline
    /// does: final lookup first, then raw lookup, rendering and storing
    /// whatever was missing.
    pub fn pipeline(
        &self,
        cache: &FrameCache,
        ctx: &RenderContext,
        strip: &Arc<Strip>,
        timeline_frame: i32,
    ) -> (Arc<FrameBuffer>, RenderPath) {
        let tf = timeline_frame as f32;
        if let Some(frame) = cache.get(ctx, strip, tf, CacheStage::FinalOutput) {
            return (frame, RenderPath::CachedFinal);
        }

        let (raw, path) = match cache.get(ctx, strip, tf, CacheStage::Raw) {
            Some(raw) => (raw, RenderPath::CachedRaw),
            None => {
                let raw = self.render_raw(cache, strip, timeline_frame);
                cache.put_if_possible(ctx, strip, tf, CacheStage::Raw, Arc::clone(&raw));
                (raw, RenderPath::Cold)
            }
        };

        let finished = self.render_final(cache, &raw);
        cache.put(ctx, strip, tf, CacheStage::FinalOutput, Arc::clone(&finished));
        (finished, path)
    }
}

/// Fill byte a fresh raw decode of `strip` at `timeline_frame` would carry.
pub fn expected_raw_fill(strip: &Strip, timeline_frame: i32) -> u8 {
    let name_tag = strip.name().bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    let media_frame = strip.source_frame_index(timeline_frame as f32) as i32;
    name_tag ^ (media_frame & 0xff) as u8
}

/// Fill byte the finished frame for `strip` at `timeline_frame` should carry.
pub fn expected_final_fill(strip: &Strip, timeline_frame: i32) -> u8 {
    expected_raw_fill(strip, timeline_frame).wrapping_add(1)
}
