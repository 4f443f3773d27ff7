//! Cache identity: stages, render-context fingerprint, composite keys

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use bitflags::bitflags;

use crate::strip::Strip;

/// Pipeline phase a cached image represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStage {
    /// Decoded source media, before any per-strip processing.
    Raw,
    /// After per-strip transforms (crop, scale, color).
    Preprocessed,
    /// Combined output of a strip and everything under it.
    Composite,
    /// The finished frame handed to playback.
    FinalOutput,
}

impl CacheStage {
    /// Mask containing just this stage.
    pub fn mask(self) -> StageMask {
        match self {
            CacheStage::Raw => StageMask::RAW,
            CacheStage::Preprocessed => StageMask::PREPROCESSED,
            CacheStage::Composite => StageMask::COMPOSITE,
            CacheStage::FinalOutput => StageMask::FINAL_OUTPUT,
        }
    }

    /// Stable numeric code used by the disk tier.
    pub fn code(self) -> u8 {
        match self {
            CacheStage::Raw => 0,
            CacheStage::Preprocessed => 1,
            CacheStage::Composite => 2,
            CacheStage::FinalOutput => 3,
        }
    }

    /// Inverse of [`CacheStage::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CacheStage::Raw),
            1 => Some(CacheStage::Preprocessed),
            2 => Some(CacheStage::Composite),
            3 => Some(CacheStage::FinalOutput),
            _ => None,
        }
    }
}

bitflags! {
    /// A set of cache stages, for stored-stage selection and invalidation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StageMask: u32 {
        /// [`CacheStage::Raw`]
        const RAW = 1 << 0;
        /// [`CacheStage::Preprocessed`]
        const PREPROCESSED = 1 << 1;
        /// [`CacheStage::Composite`]
        const COMPOSITE = 1 << 2;
        /// [`CacheStage::FinalOutput`]
        const FINAL_OUTPUT = 1 << 3;
        /// Every stage below final output.
        const SOURCE = Self::RAW.bits() | Self::PREPROCESSED.bits() | Self::COMPOSITE.bits();
    }
}

/// Identifies the task a render originated from. Metadata on an entry, never
/// part of key identity; `free_temp_cache` reclaims per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u16);

impl TaskId {
    /// The interactive/main render path.
    pub const MAIN_RENDER: TaskId = TaskId(0);
    /// The background prefetch renderer.
    pub const PREFETCH_RENDER: TaskId = TaskId(1);
}

/// Preview resolution bucket a render was produced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreviewScale {
    /// 25% proxy resolution.
    Quarter,
    /// 50% proxy resolution.
    Half,
    /// 75% proxy resolution.
    ThreeQuarter,
    /// Full project resolution.
    Original,
}

/// Everything a producer passes along with a cache call.
///
/// The identity fields become part of the key fingerprint; the boolean flags
/// only steer behavior for the one call they accompany.
#[derive(Debug, Clone)]
pub struct RenderContext {
    /// Owning session identity; part of key equality.
    pub session_id: u64,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Preview resolution of the render.
    pub preview_scale: PreviewScale,
    /// Motion blur shutter interval.
    pub motion_blur_shutter: f32,
    /// Motion blur sample count.
    pub motion_blur_samples: u32,
    /// Multi-view index.
    pub view_id: u32,
    /// Task this render originates from.
    pub task_id: TaskId,
    /// Speculative result: inserted temporary, never touches the disk tier.
    pub for_render: bool,
    /// Bypass the cache entirely for this call.
    pub skip_cache: bool,
    /// Proxy-resolution render; never cached.
    pub is_proxy_render: bool,
}

impl RenderContext {
    /// Context with neutral identity extras and no behavior flags set.
    pub fn new(session_id: u64, width: u32, height: u32) -> Self {
        Self {
            session_id,
            width,
            height,
            preview_scale: PreviewScale::Original,
            motion_blur_shutter: 0.0,
            motion_blur_samples: 0,
            view_id: 0,
            task_id: TaskId::MAIN_RENDER,
            for_render: false,
            skip_cache: false,
            is_proxy_render: false,
        }
    }
}

/// The render-context fields that participate in key identity.
///
/// The shutter is held as its bit pattern so equality stays reflexive and
/// agrees with the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextFingerprint {
    session_id: u64,
    width: u32,
    height: u32,
    preview_scale: PreviewScale,
    shutter_bits: u32,
    motion_blur_samples: u32,
    view_id: u32,
}

impl From<&RenderContext> for ContextFingerprint {
    fn from(ctx: &RenderContext) -> Self {
        Self {
            session_id: ctx.session_id,
            width: ctx.width,
            height: ctx.height,
            preview_scale: ctx.preview_scale,
            shutter_bits: ctx.motion_blur_shutter.to_bits(),
            motion_blur_samples: ctx.motion_blur_samples,
            view_id: ctx.view_id,
        }
    }
}

// Fixed seeds: disk filenames derived from digests must survive restarts.
const DIGEST_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
);

/// Identity of one cached image.
///
/// Equality and hashing cover exactly: strip handle identity, frame-index
/// bit pattern, stage tag, and the context fingerprint.
#[derive(Debug, Clone)]
pub struct CacheKey {
    strip: Arc<Strip>,
    fingerprint: ContextFingerprint,
    frame_index: f32,
    stage: CacheStage,
}

impl CacheKey {
    /// Build the key a `(context, strip, timeline_frame, stage)` request
    /// resolves to.
    pub fn new(
        ctx: &RenderContext,
        strip: &Arc<Strip>,
        timeline_frame: f32,
        stage: CacheStage,
    ) -> Self {
        Self {
            strip: Arc::clone(strip),
            fingerprint: ContextFingerprint::from(ctx),
            frame_index: Self::frame_index_for(strip, timeline_frame, stage),
            stage,
        }
    }

    /// Stage-dependent mapping from timeline frame to stored frame index.
    ///
    /// Raw entries on media strips key on the media frame, so a still image
    /// or an extended clip serves many timeline frames from one entry. All
    /// other combinations key on the offset from the strip's start.
    pub fn frame_index_for(strip: &Strip, timeline_frame: f32, stage: CacheStage) -> f32 {
        if stage == CacheStage::Raw && !strip.is_effect() {
            strip.source_frame_index(timeline_frame)
        } else {
            timeline_frame - strip.start_frame() as f32
        }
    }

    /// The strip this entry belongs to.
    pub fn strip(&self) -> &Arc<Strip> {
        &self.strip
    }

    /// Stored frame index (stage-dependent, see [`CacheKey::frame_index_for`]).
    pub fn frame_index(&self) -> f32 {
        self.frame_index
    }

    /// Stage tag.
    pub fn stage(&self) -> CacheStage {
        self.stage
    }

    /// Reconstruct the timeline frame this entry was stored for.
    ///
    /// Inverts the non-Raw mapping only: exact for Preprocessed, Composite
    /// and FinalOutput entries, approximate for Raw entries whose media
    /// mapping is not linear (still images, extended clips).
    pub fn timeline_frame(&self) -> i32 {
        (self.frame_index + self.strip.start_frame() as f32) as i32
    }

    /// Deterministic 64-bit digest for the disk tier.
    ///
    /// Covers the logical key content (strip name, not handle identity; no
    /// session id) so the same entry resolves to the same file across
    /// processes.
    pub fn stable_digest(&self) -> u64 {
        let state = ahash::RandomState::with_seeds(
            DIGEST_SEEDS.0,
            DIGEST_SEEDS.1,
            DIGEST_SEEDS.2,
            DIGEST_SEEDS.3,
        );
        let mut h = state.build_hasher();
        self.strip.name().hash(&mut h);
        h.write_u32(self.frame_index.to_bits());
        h.write_u8(self.stage.code());
        h.write_u32(self.fingerprint.width);
        h.write_u32(self.fingerprint.height);
        h.write_u8(self.fingerprint.preview_scale as u8);
        h.write_u32(self.fingerprint.shutter_bits);
        h.write_u32(self.fingerprint.motion_blur_samples);
        h.write_u32(self.fingerprint.view_id);
        h.finish()
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.strip, &other.strip)
            && self.frame_index.to_bits() == other.frame_index.to_bits()
            && self.stage == other.stage
            && self.fingerprint == other.fingerprint
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.strip) as usize).hash(state);
        state.write_u32(self.frame_index.to_bits());
        self.stage.hash(state);
        self.fingerprint.hash(state);
    }
}
