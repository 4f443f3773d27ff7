//! # reelcache
//!
//! Frame-image cache for sequence rendering.
//!
//! ## Architecture
//! - **Keys**: (strip, frame index, render context, stage), compared
//!   structurally with strip identity by handle
//! - **Table**: AHash map into an arena of entries; chain links are slot
//!   indices
//! - **Eviction**: playhead-distance policy over chain tails, whole chains
//!   at a time, prefetch-range aware
//! - **Tiers**: RAM first, optional spill-to-disk behind the [`DiskTier`]
//!   trait

#![warn(missing_docs)]

mod disk;
mod frame;
mod key;
mod prefetch;
mod stats;
mod store;
mod strip;
mod table;

pub use disk::{DiskTier, DiskTierProvider};
pub use frame::{FrameBuffer, MemoryBudget};
pub use key::{CacheKey, CacheStage, PreviewScale, RenderContext, StageMask, TaskId};
pub use prefetch::PrefetchStatus;
pub use stats::CacheStats;
pub use store::{CacheSettings, FrameCache};
pub use strip::{Strip, StripSource};
