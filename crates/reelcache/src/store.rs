//! FrameCache: the per-session frame store
//!
//! One instance per editing session. A single mutex serializes every table
//! mutation and full-table scan; disk tier I/O always happens outside it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::disk::{DiskSlot, DiskTierProvider};
use crate::frame::{FrameBuffer, MemoryBudget};
use crate::key::{CacheKey, CacheStage, RenderContext, StageMask, TaskId};
use crate::prefetch::PrefetchStatus;
use crate::stats::CacheStats;
use crate::strip::Strip;
use crate::table::EntryTable;

/// Session-wide cache behavior.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Stages inserted as permanent entries. Everything else inserts
    /// temporary, reclaimable by [`FrameCache::free_temp_cache`]. A strip
    /// may override this per [`Strip::set_stage_override`], except for
    /// `FinalOutput` which always follows this setting.
    pub stored_stages: StageMask,
    /// When set, an active prefetch range vetoes eviction candidates that
    /// fall inside it.
    pub prefetch_enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stored_stages: StageMask::FINAL_OUTPUT,
            prefetch_enabled: false,
        }
    }
}

/// Bounded concurrent cache of rendered frames, keyed by
/// (strip, frame, render context, stage).
///
/// Permanent entries are threaded into insertion-order chains, one chain per
/// compose pass (closed by each `FinalOutput` insertion); eviction removes
/// whole chains so a composed frame never loses only part of its dependent
/// stages. Temporary entries live outside the chains and are reclaimed by
/// [`FrameCache::free_temp_cache`] once playback moves on.
pub struct FrameCache {
    table: Mutex<EntryTable>,
    budget: Arc<MemoryBudget>,
    prefetch: Arc<PrefetchStatus>,
    settings: CacheSettings,
    disk: DiskSlot,
    playhead: AtomicI32,
    stats: CacheStats,
}

impl FrameCache {
    /// Create a store for one session.
    ///
    /// # Arguments
    /// * `budget` - Shared byte budget driving eviction
    /// * `prefetch` - Shared prefetch status published by the scheduler
    /// * `settings` - Stored-stage selection and prefetch gating
    /// * `disk_provider` - Builds the spill-to-disk tier on first use;
    ///   `None` keeps the store RAM-only
    pub fn new(
        budget: Arc<MemoryBudget>,
        prefetch: Arc<PrefetchStatus>,
        settings: CacheSettings,
        disk_provider: Option<DiskTierProvider>,
    ) -> Self {
        Self {
            table: Mutex::new(EntryTable::new()),
            budget,
            prefetch,
            settings,
            disk: DiskSlot::new(disk_provider),
            playhead: AtomicI32::new(0),
            stats: CacheStats::new(),
        }
    }

    /// Look up the frame cached for `(context, strip, timeline_frame, stage)`.
    ///
    /// On a RAM hit the returned `Arc` is one more reference to the cached
    /// buffer. On a RAM miss the disk tier is consulted (unless the context
    /// is flagged for-render: speculative results never fault in from disk).
    /// A disk hit is returned and pulled back into RAM so the next lookup is
    /// cheap; `FinalOutput` frames are only reinserted when eviction can make
    /// room for them.
    ///
    /// # Returns
    /// * `Option<Arc<FrameBuffer>>` - The cached frame, or `None` on miss
    pub fn get(
        &self,
        ctx: &RenderContext,
        strip: &Arc<Strip>,
        timeline_frame: f32,
        stage: CacheStage,
    ) -> Option<Arc<FrameBuffer>> {
        if ctx.skip_cache || ctx.is_proxy_render {
            return None;
        }
        let key = CacheKey::new(ctx, strip, timeline_frame, stage);

        {
            let table = self.table.lock();
            if let Some(entry) = table.lookup(&key) {
                self.stats.record_hit();
                return Some(Arc::clone(&entry.frame));
            }
        }
        self.stats.record_miss();

        if ctx.for_render {
            return None;
        }

        let tier = self.disk.get_or_create()?;
        let frame = tier.read(&key)?;
        self.stats.record_disk_hit();

        if stage != CacheStage::FinalOutput || self.recycle() {
            let is_temp = !self.effective_stored_stages(strip).contains(stage.mask());
            let mut table = self.table.lock();
            // A racing caller may have inserted while the disk read ran.
            if table.lookup(&key).is_none() {
                table.insert(key, Arc::clone(&frame), is_temp, ctx.task_id);
                self.stats.record_insert();
            }
        }
        Some(frame)
    }

    /// Store a rendered frame.
    ///
    /// Always stores (evicting nothing); use [`FrameCache::put_if_possible`]
    /// from producers that must not push the cache over budget. The entry is
    /// temporary if the context is flagged for-render or the stage is outside
    /// the effective stored-stage selection. Permanent entries join the
    /// current chain and are written through to the disk tier; a `FinalOutput`
    /// insertion then closes the chain.
    ///
    /// Storing over a live key is a no-op: the existing entry wins, because
    /// replacing it would corrupt chain links.
    pub fn put(
        &self,
        ctx: &RenderContext,
        strip: &Arc<Strip>,
        timeline_frame: f32,
        stage: CacheStage,
        frame: Arc<FrameBuffer>,
    ) {
        if ctx.skip_cache || ctx.is_proxy_render {
            return;
        }
        // The duplicate check is a full lookup: a disk-resident copy also
        // wins over a fresh insert.
        if self.get(ctx, strip, timeline_frame, stage).is_some() {
            return;
        }

        let key = CacheKey::new(ctx, strip, timeline_frame, stage);
        let is_temp =
            ctx.for_render || !self.effective_stored_stages(strip).contains(stage.mask());

        {
            let mut table = self.table.lock();
            // Re-check under the lock; another producer may have won the race
            // since the lookup above released it.
            if table.lookup(&key).is_some() {
                return;
            }
            table.insert(key.clone(), Arc::clone(&frame), is_temp, ctx.task_id);
        }
        self.stats.record_insert();

        if !is_temp {
            if let Some(tier) = self.disk.get_or_create() {
                tier.write(&key, &frame);
                tier.enforce_size_limit();
                self.stats.record_disk_write();
            }
        }
    }

    /// Store a rendered frame only if the cache can stay within budget.
    ///
    /// Evicts first; when eviction frees enough room the frame is stored as
    /// by [`FrameCache::put`] and `true` is returned. When it cannot, the
    /// chain being built is surrendered instead: its entries become
    /// temporary and unlinked (reclaimable by `free_temp_cache`), the chain
    /// tail resets, nothing is stored, and `false` is returned.
    pub fn put_if_possible(
        &self,
        ctx: &RenderContext,
        strip: &Arc<Strip>,
        timeline_frame: f32,
        stage: CacheStage,
        frame: Arc<FrameBuffer>,
    ) -> bool {
        if self.recycle() {
            self.put(ctx, strip, timeline_frame, stage, frame);
            return true;
        }

        let mut table = self.table.lock();
        if let Some(tail) = table.last_key {
            table.demote_chain(tail);
        }
        table.last_key = None;
        false
    }

    /// Evict chains until the budget is no longer exceeded.
    ///
    /// Returns false when the budget is still exceeded but nothing is
    /// evictable: the remaining entries are temporary or mid-chain, or an
    /// active prefetch range shields them.
    pub fn recycle(&self) -> bool {
        let mut table = self.table.lock();
        while self.budget.is_over_budget() {
            let Some(victim) = self.choose_eviction_candidate(&table) else {
                return false;
            };
            let removed = table.remove_chain(victim);
            self.stats.record_evictions(removed as u64);
        }
        true
    }

    /// Remove temporary entries of `task_id` that are stale for
    /// `timeline_frame`: the frame index recomputed at the current position
    /// differs from the stored one, or the frame left the strip's trimmed
    /// range. Raw entries keyed on media frames survive as long as they still
    /// serve the current frame.
    pub fn free_temp_cache(&self, task_id: TaskId, timeline_frame: i32) {
        let mut table = self.table.lock();
        let stale: Vec<usize> = table
            .iter()
            .filter(|(_, entry)| entry.is_temp && entry.task_id == task_id)
            .filter(|(_, entry)| {
                let strip = entry.key.strip();
                let recomputed =
                    CacheKey::frame_index_for(strip, timeline_frame as f32, entry.key.stage());
                recomputed.to_bits() != entry.key.frame_index().to_bits()
                    || !strip.contains_frame(timeline_frame)
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in stale {
            table.unlink(idx);
            table.remove(idx);
        }
    }

    /// Remove entries invalidated by an edit to `changed_strip`.
    ///
    /// The affected range is the changed strip's trimmed range, intersected
    /// with `strip`'s unless `force_changed_range` is set. The `FinalOutput`
    /// portion of `stages` removes matching entries of any strip in that
    /// range; the source portion removes matching entries of `strip` itself
    /// within the changed strip's range. A disk tier that already exists is
    /// invalidated first; one is never created for this.
    pub fn invalidate(
        &self,
        strip: &Arc<Strip>,
        changed_strip: &Arc<Strip>,
        stages: StageMask,
        force_changed_range: bool,
    ) {
        if let Some(tier) = self.disk.created() {
            tier.invalidate(strip, changed_strip, stages);
        }

        let changed_start = changed_strip.left_handle();
        let changed_end = changed_strip.right_handle();
        let (range_start, range_end) = if force_changed_range {
            (changed_start, changed_end)
        } else {
            (
                changed_start.max(strip.left_handle()),
                changed_end.min(strip.right_handle()),
            )
        };

        let final_mask = stages & StageMask::FINAL_OUTPUT;
        let source_mask = stages & StageMask::SOURCE;

        let mut table = self.table.lock();
        let doomed: Vec<usize> = table
            .iter()
            .filter(|(_, entry)| {
                let tf = entry.key.timeline_frame();
                let stage = entry.key.stage().mask();
                if stage.intersects(final_mask) && tf >= range_start && tf <= range_end {
                    return true;
                }
                stage.intersects(source_mask)
                    && Arc::ptr_eq(entry.key.strip(), strip)
                    && tf >= changed_start
                    && tf <= changed_end
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in doomed {
            table.unlink(idx);
            table.remove(idx);
        }
        table.last_key = None;
    }

    /// Stop any in-flight prefetch and drop every entry.
    pub fn cleanup(&self) {
        self.prefetch.stop();
        self.table.lock().clear();
    }

    /// Enumerate live entries under the lock.
    ///
    /// `init` receives the entry count and may abort by returning true;
    /// `visit` receives `(strip, timeline_frame, stage)` per entry and may do
    /// the same. The reported timeline frame is reconstructed from the stored
    /// frame index, which is approximate for Raw entries with non-linear
    /// media mappings. Finishing the enumeration resets the chain tail.
    pub fn iterate<I, V>(&self, init: I, mut visit: V)
    where
        I: FnOnce(usize) -> bool,
        V: FnMut(&Arc<Strip>, i32, CacheStage) -> bool,
    {
        let mut table = self.table.lock();
        let mut interrupt = init(table.len());
        for (_, entry) in table.iter() {
            if interrupt {
                break;
            }
            interrupt = visit(
                entry.key.strip(),
                entry.key.timeline_frame(),
                entry.key.stage(),
            );
        }
        table.last_key = None;
    }

    /// Publish the current playback frame; eviction compares distances to it.
    pub fn set_playhead(&self, frame: i32) {
        self.playhead.store(frame, Ordering::Relaxed);
    }

    /// Playback frame last published by [`FrameCache::set_playhead`].
    pub fn playhead(&self) -> i32 {
        self.playhead.load(Ordering::Relaxed)
    }

    /// True when the session budget is exceeded.
    pub fn is_over_budget(&self) -> bool {
        self.budget.is_over_budget()
    }

    /// The budget this store evicts against.
    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Cache activity counters.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    // Per-strip override else session selection; the session's FinalOutput
    // bit always applies.
    fn effective_stored_stages(&self, strip: &Strip) -> StageMask {
        let base = strip
            .stage_override()
            .unwrap_or(self.settings.stored_stages);
        base | (self.settings.stored_stages & StageMask::FINAL_OUTPUT)
    }

    /// Pick the entry whose chain should be evicted next, or `None` to keep
    /// everything.
    ///
    /// Candidates are permanent chain tails (`link_next == None`; removing a
    /// mid-chain entry would split a compose pass). Of the leftmost and
    /// rightmost candidates by timeline frame: while a prefetch is running,
    /// prefer one outside its range and refuse if both are inside; otherwise
    /// evict the one farther from the playhead, ties going right.
    fn choose_eviction_candidate(&self, table: &EntryTable) -> Option<usize> {
        let mut leftmost: Option<(usize, i32)> = None;
        let mut rightmost: Option<(usize, i32)> = None;

        for (idx, entry) in table.iter() {
            if entry.is_temp || entry.link_next.is_some() {
                continue;
            }
            let tf = entry.key.timeline_frame();
            if leftmost.map_or(true, |(_, lf)| tf < lf) {
                leftmost = Some((idx, tf));
            }
            if rightmost.map_or(true, |(_, rf)| tf > rf) {
                rightmost = Some((idx, tf));
            }
        }

        let (lidx, lframe) = leftmost?;
        let (ridx, rframe) = rightmost?;

        if self.settings.prefetch_enabled && self.prefetch.is_running() {
            let (start, end) = self.prefetch.active_range();
            if lframe < start || lframe > end {
                return Some(lidx);
            }
            if rframe < start || rframe > end {
                return Some(ridx);
            }
            // Both candidates carry in-flight prefetch work.
            return None;
        }

        let playhead = self.playhead();
        let l_diff = playhead - lframe;
        let r_diff = rframe - playhead;
        if l_diff > r_diff {
            Some(lidx)
        } else {
            Some(ridx)
        }
    }

    #[cfg(test)]
    fn assert_chain_consistent(&self) {
        self.table.lock().assert_chain_consistent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskTier;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    const FRAME_BYTES: usize = 64;

    fn all_stages() -> CacheSettings {
        CacheSettings {
            stored_stages: StageMask::SOURCE | StageMask::FINAL_OUTPUT,
            prefetch_enabled: false,
        }
    }

    struct Harness {
        budget: Arc<MemoryBudget>,
        prefetch: Arc<PrefetchStatus>,
        cache: FrameCache,
    }

    fn harness(limit: usize, settings: CacheSettings) -> Harness {
        harness_with_disk(limit, settings, None)
    }

    fn harness_with_disk(
        limit: usize,
        settings: CacheSettings,
        disk_provider: Option<DiskTierProvider>,
    ) -> Harness {
        let budget = MemoryBudget::new(limit);
        let prefetch = PrefetchStatus::new();
        let cache = FrameCache::new(
            Arc::clone(&budget),
            Arc::clone(&prefetch),
            settings,
            disk_provider,
        );
        Harness {
            budget,
            prefetch,
            cache,
        }
    }

    fn frame_with(budget: &Arc<MemoryBudget>, fill: u8) -> Arc<FrameBuffer> {
        Arc::new(FrameBuffer::alloc(budget, 4, 4, vec![fill; FRAME_BYTES]))
    }

    fn frame(budget: &Arc<MemoryBudget>) -> Arc<FrameBuffer> {
        frame_with(budget, 0)
    }

    fn ctx() -> RenderContext {
        RenderContext::new(1, 1920, 1080)
    }

    /// In-memory disk tier keyed by stable digest, counting traffic.
    struct StubTier {
        budget: Arc<MemoryBudget>,
        frames: Mutex<HashMap<u64, (u32, u32, Vec<u8>)>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        invalidations: AtomicUsize,
    }

    impl StubTier {
        fn new(budget: &Arc<MemoryBudget>) -> Arc<Self> {
            Arc::new(Self {
                budget: Arc::clone(budget),
                frames: Mutex::new(HashMap::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                invalidations: AtomicUsize::new(0),
            })
        }

        fn provider(self: &Arc<Self>) -> Option<DiskTierProvider> {
            let tier = Arc::clone(self);
            Some(Box::new(move || {
                Some(Arc::clone(&tier) as Arc<dyn DiskTier>)
            }))
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::Relaxed)
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::Relaxed)
        }

        fn invalidations(&self) -> usize {
            self.invalidations.load(Ordering::Relaxed)
        }
    }

    impl DiskTier for StubTier {
        fn read(&self, key: &CacheKey) -> Option<Arc<FrameBuffer>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.frames
                .lock()
                .get(&key.stable_digest())
                .map(|(w, h, data)| {
                    Arc::new(FrameBuffer::alloc(&self.budget, *w, *h, data.clone()))
                })
        }

        fn write(&self, key: &CacheKey, frame: &Arc<FrameBuffer>) {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.frames.lock().insert(
                key.stable_digest(),
                (frame.width(), frame.height(), frame.data().to_vec()),
            );
        }

        fn invalidate(&self, _strip: &Arc<Strip>, _changed: &Arc<Strip>, _stages: StageMask) {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }

        fn enforce_size_limit(&self) {}
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame_with(&h.budget, 42));
        let got = h
            .cache
            .get(&ctx(), &strip, 10.0, CacheStage::Composite)
            .expect("stored entry");

        assert_eq!(got.data(), &[42u8; FRAME_BYTES][..]);
        assert_eq!(h.cache.len(), 1);
        assert_eq!(h.cache.stats().inserts(), 1);
        assert_eq!(h.cache.stats().hits(), 1);
    }

    #[test]
    fn test_miss_returns_none() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::Raw).is_none());
        assert_eq!(h.cache.stats().misses(), 1);
    }

    #[test]
    fn test_skip_cache_and_proxy_bypass() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        let mut skipping = ctx();
        skipping.skip_cache = true;
        h.cache
            .put(&skipping, &strip, 10.0, CacheStage::Raw, frame(&h.budget));
        assert!(h.cache.is_empty());
        assert!(h.cache.get(&skipping, &strip, 10.0, CacheStage::Raw).is_none());

        let mut proxy = ctx();
        proxy.is_proxy_render = true;
        h.cache
            .put(&proxy, &strip, 10.0, CacheStage::Raw, frame(&h.budget));
        assert!(h.cache.is_empty());

        // Bypass calls leave the counters untouched.
        assert_eq!(h.cache.stats().misses(), 0);
    }

    #[test]
    fn test_raw_entry_serves_extended_range() {
        let h = harness(usize::MAX, all_stages());
        let still = Strip::image("still", 0, 0, 100);

        h.cache
            .put(&ctx(), &still, 0.0, CacheStage::Raw, frame_with(&h.budget, 7));

        // Every timeline frame of a still image maps to media frame 0.
        let got = h
            .cache
            .get(&ctx(), &still, 50.0, CacheStage::Raw)
            .expect("same media frame");
        assert_eq!(got.data()[0], 7);
        assert_eq!(h.cache.len(), 1);
    }

    #[test]
    fn test_put_twice_keeps_first_entry() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame_with(&h.budget, 1));
        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame_with(&h.budget, 2));

        assert_eq!(h.cache.len(), 1);
        assert_eq!(h.cache.stats().inserts(), 1);
        let got = h
            .cache
            .get(&ctx(), &strip, 10.0, CacheStage::Composite)
            .unwrap();
        assert_eq!(got.data()[0], 1, "existing entry wins");
        h.cache.assert_chain_consistent();

        // The discarded duplicate released its bytes; only the stored
        // buffer stays charged.
        assert_eq!(h.budget.bytes_in_use(), FRAME_BYTES);
    }

    #[test]
    fn test_eviction_keeps_cache_within_budget() {
        // Room for four frames.
        let h = harness(FRAME_BYTES * 4, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);
        h.cache.set_playhead(0);

        for tf in 0..10 {
            let stored = h.cache.put_if_possible(
                &ctx(),
                &strip,
                tf as f32,
                CacheStage::FinalOutput,
                frame(&h.budget),
            );
            assert!(stored, "every final frame is evictable");
        }

        assert!(h.cache.recycle());
        assert!(!h.cache.is_over_budget());
        assert!(h.cache.stats().evictions() > 0);
        assert!(h.cache.len() < 10);
        h.cache.assert_chain_consistent();
    }

    #[test]
    fn test_eviction_takes_entry_farther_from_playhead() {
        let h = harness(FRAME_BYTES, all_stages());
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 90.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache.set_playhead(30);

        assert!(h.cache.recycle());
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::FinalOutput).is_some());
        assert!(h.cache.get(&ctx(), &strip, 90.0, CacheStage::FinalOutput).is_none());
    }

    #[test]
    fn test_eviction_tie_goes_right() {
        let h = harness(FRAME_BYTES, all_stages());
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 90.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache.set_playhead(50);

        assert!(h.cache.recycle());
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::FinalOutput).is_some());
        assert!(h.cache.get(&ctx(), &strip, 90.0, CacheStage::FinalOutput).is_none());
    }

    #[test]
    fn test_eviction_removes_whole_chain() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        // One compose pass at frame 20, closed by its final frame.
        for stage in [
            CacheStage::Raw,
            CacheStage::Preprocessed,
            CacheStage::Composite,
            CacheStage::FinalOutput,
        ] {
            h.cache.put(&ctx(), &strip, 20.0, stage, frame(&h.budget));
        }
        h.cache
            .put(&ctx(), &strip, 80.0, CacheStage::FinalOutput, frame(&h.budget));
        assert_eq!(h.cache.len(), 5);

        // Force one eviction pass; frame 20 is farther from the playhead.
        h.budget.set_limit(FRAME_BYTES * 4);
        h.cache.set_playhead(75);
        assert!(h.cache.recycle());

        assert_eq!(h.cache.len(), 1, "the whole pass went together");
        assert_eq!(h.cache.stats().evictions(), 4);
        assert!(h.cache.get(&ctx(), &strip, 20.0, CacheStage::Raw).is_none());
        assert!(h.cache.get(&ctx(), &strip, 20.0, CacheStage::Composite).is_none());
        assert!(h.cache.get(&ctx(), &strip, 80.0, CacheStage::FinalOutput).is_some());
        h.cache.assert_chain_consistent();
    }

    #[test]
    fn test_temp_entries_are_not_eviction_candidates() {
        // Only final frames are stored; composite inserts are temporary.
        let h = harness(usize::MAX, CacheSettings::default());
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 50.0, CacheStage::FinalOutput, frame(&h.budget));

        // Exceed the budget with bytes the cache cannot free.
        h.budget.set_limit(FRAME_BYTES);
        let _held = frame(&h.budget);

        assert!(!h.cache.recycle(), "only the final frame was evictable");
        assert!(h.cache.get(&ctx(), &strip, 50.0, CacheStage::FinalOutput).is_none());
        assert!(
            h.cache.get(&ctx(), &strip, 10.0, CacheStage::Composite).is_some(),
            "temporary entries are reclaimed, never evicted"
        );
    }

    #[test]
    fn test_prefetch_range_shields_candidates() {
        let mut settings = all_stages();
        settings.prefetch_enabled = true;
        let h = harness(FRAME_BYTES, settings);
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 35.0, CacheStage::FinalOutput, frame(&h.budget));
        h.prefetch.begin(30, 40);

        // Frame 10 is outside the active range and goes first.
        assert!(h.cache.recycle());
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::FinalOutput).is_none());
        assert!(h.cache.get(&ctx(), &strip, 35.0, CacheStage::FinalOutput).is_some());

        // With only in-range work left, eviction refuses entirely.
        h.budget.set_limit(0);
        assert!(!h.cache.recycle());
        assert!(h.cache.get(&ctx(), &strip, 35.0, CacheStage::FinalOutput).is_some());

        // Once the prefetch finishes, the shield drops.
        h.prefetch.finish();
        assert!(h.cache.recycle());
        assert!(h.cache.get(&ctx(), &strip, 35.0, CacheStage::FinalOutput).is_none());
    }

    #[test]
    fn test_failed_put_demotes_chain() {
        let mut settings = all_stages();
        settings.prefetch_enabled = true;
        let h = harness(FRAME_BYTES * 2, settings);
        let strip = Strip::clip("clip", 0, 200, 0, 199);

        // An open chain inside the prefetch range; eviction may not touch it.
        h.cache
            .put(&ctx(), &strip, 35.0, CacheStage::Raw, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 35.0, CacheStage::Composite, frame(&h.budget));
        h.prefetch.begin(30, 40);

        let stored = h.cache.put_if_possible(
            &ctx(),
            &strip,
            36.0,
            CacheStage::FinalOutput,
            frame(&h.budget),
        );

        assert!(!stored);
        assert_eq!(h.cache.len(), 2, "nothing stored, nothing evicted");
        assert!(h.cache.get(&ctx(), &strip, 36.0, CacheStage::FinalOutput).is_none());
        h.cache.assert_chain_consistent();

        // The surrendered chain is temporary now: reclaimable once the
        // playhead moves past the strip.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 250);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_free_temp_cache_reclaims_stale_frames() {
        // Final-only storage: composite entries insert temporary.
        let h = harness(usize::MAX, CacheSettings::default());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame(&h.budget));

        // Still valid at its own frame.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 10);
        assert_eq!(h.cache.len(), 1);

        // Playback moved on: the frame index no longer matches.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 11);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_free_temp_cache_keeps_shared_raw_media() {
        let h = harness(usize::MAX, CacheSettings::default());
        let still = Strip::image("still", 0, 0, 100);

        h.cache
            .put(&ctx(), &still, 5.0, CacheStage::Raw, frame(&h.budget));

        // A still image's raw entry serves every frame in range.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 50);
        assert_eq!(h.cache.len(), 1);

        // Outside the trimmed range it finally goes.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 101);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_free_temp_cache_filters_by_task() {
        let h = harness(usize::MAX, CacheSettings::default());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        let mut prefetch_ctx = ctx();
        prefetch_ctx.task_id = TaskId::PREFETCH_RENDER;
        h.cache
            .put(&prefetch_ctx, &strip, 10.0, CacheStage::Composite, frame(&h.budget));

        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 99);
        assert_eq!(h.cache.len(), 1, "other task's entries stay");

        h.cache.free_temp_cache(TaskId::PREFETCH_RENDER, 99);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_invalidate_overlap_hits_shared_frame() {
        let h = harness(usize::MAX, all_stages());
        let a = Strip::clip("a", 10, 50, 10, 20);
        let b = Strip::clip("b", 15, 50, 15, 25);

        // B's composite at frame 18, inside the overlap of A and B.
        h.cache
            .put(&ctx(), &b, 18.0, CacheStage::Composite, frame(&h.budget));
        // B's composite at frame 5 was cached before a handle edit; it lies
        // outside A's current range.
        h.cache
            .put(&ctx(), &b, 5.0, CacheStage::Composite, frame(&h.budget));

        h.cache
            .invalidate(&b, &a, StageMask::COMPOSITE, false);

        assert!(h.cache.get(&ctx(), &b, 18.0, CacheStage::Composite).is_none());
        assert!(
            h.cache.get(&ctx(), &b, 5.0, CacheStage::Composite).is_some(),
            "outside the changed range"
        );
        h.cache.assert_chain_consistent();
    }

    #[test]
    fn test_invalidate_final_output_spans_strips() {
        let h = harness(usize::MAX, all_stages());
        let a = Strip::clip("a", 10, 50, 10, 20);
        let other = Strip::clip("other", 0, 200, 0, 199);

        h.cache
            .put(&ctx(), &other, 12.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache
            .put(&ctx(), &other, 30.0, CacheStage::FinalOutput, frame(&h.budget));
        // Source entry of an unrelated strip in range: stays.
        h.cache
            .put(&ctx(), &other, 12.0, CacheStage::Composite, frame(&h.budget));

        h.cache.invalidate(
            &a,
            &a,
            StageMask::FINAL_OUTPUT | StageMask::COMPOSITE,
            false,
        );

        assert!(
            h.cache.get(&ctx(), &other, 12.0, CacheStage::FinalOutput).is_none(),
            "final frames in range go regardless of strip"
        );
        assert!(h.cache.get(&ctx(), &other, 30.0, CacheStage::FinalOutput).is_some());
        assert!(
            h.cache.get(&ctx(), &other, 12.0, CacheStage::Composite).is_some(),
            "source invalidation is scoped to the affected strip"
        );
    }

    #[test]
    fn test_invalidate_force_skips_intersection() {
        let h = harness(usize::MAX, all_stages());
        let a = Strip::clip("a", 10, 50, 10, 20);
        let b = Strip::clip("b", 15, 50, 15, 25);

        h.cache
            .put(&ctx(), &a, 22.0, CacheStage::FinalOutput, frame(&h.budget));

        // Frame 22 is in B's range but outside A∩B = [15, 20].
        h.cache.invalidate(&a, &b, StageMask::FINAL_OUTPUT, false);
        assert_eq!(h.cache.len(), 1);

        h.cache.invalidate(&a, &b, StageMask::FINAL_OUTPUT, true);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_cleanup_stops_prefetch_and_clears() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.prefetch.begin(0, 50);
        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 11.0, CacheStage::Raw, frame(&h.budget));

        h.cache.cleanup();

        assert!(h.cache.is_empty());
        assert!(!h.prefetch.is_running());
        assert!(h.prefetch.is_stop_requested());
        assert_eq!(h.budget.bytes_in_use(), 0);
    }

    #[test]
    fn test_iterate_reports_all_entries() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 5, 100, 5, 90);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame(&h.budget));
        h.cache
            .put(&ctx(), &strip, 20.0, CacheStage::FinalOutput, frame(&h.budget));

        let mut reported = Vec::new();
        let mut total = 0;
        h.cache.iterate(
            |count| {
                total = count;
                false
            },
            |strip, tf, stage| {
                reported.push((strip.name().to_owned(), tf, stage));
                false
            },
        );

        assert_eq!(total, 2);
        reported.sort_by_key(|(_, tf, _)| *tf);
        assert_eq!(reported[0], ("clip".to_owned(), 10, CacheStage::Composite));
        assert_eq!(reported[1], ("clip".to_owned(), 20, CacheStage::FinalOutput));
    }

    #[test]
    fn test_iterate_early_interrupt() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);
        for tf in 0..5 {
            h.cache
                .put(&ctx(), &strip, tf as f32, CacheStage::FinalOutput, frame(&h.budget));
        }

        let mut visited = 0;
        h.cache.iterate(
            |_| false,
            |_, _, _| {
                visited += 1;
                visited >= 2
            },
        );
        assert_eq!(visited, 2);

        // Init may refuse the whole enumeration.
        let mut called = false;
        h.cache.iterate(
            |_| true,
            |_, _, _| {
                called = true;
                false
            },
        );
        assert!(!called);
    }

    #[test]
    fn test_iterate_resets_chain_tail() {
        let h = harness(FRAME_BYTES, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Raw, frame(&h.budget));
        h.cache.iterate(|_| false, |_, _, _| false);
        h.cache
            .put(&ctx(), &strip, 20.0, CacheStage::Composite, frame(&h.budget));

        // Were the two entries chained, evicting one would take both.
        h.cache.set_playhead(0);
        assert!(h.cache.recycle());
        assert_eq!(h.cache.len(), 1);
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::Raw).is_some());
        h.cache.assert_chain_consistent();
    }

    #[test]
    fn test_for_render_put_is_temporary_and_ram_only() {
        let budget_probe = MemoryBudget::new(usize::MAX);
        let tier = StubTier::new(&budget_probe);
        let h = harness_with_disk(usize::MAX, all_stages(), tier.provider());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        let mut speculative = ctx();
        speculative.for_render = true;
        h.cache.put(
            &speculative,
            &strip,
            10.0,
            CacheStage::FinalOutput,
            frame(&h.budget),
        );

        assert_eq!(tier.writes(), 0, "speculative results stay RAM-only");
        assert_eq!(h.cache.len(), 1);

        // And they are reclaimable like any temporary entry.
        h.cache.free_temp_cache(TaskId::MAIN_RENDER, 11);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn test_for_render_get_skips_disk() {
        let tier_budget = MemoryBudget::new(usize::MAX);
        let tier = StubTier::new(&tier_budget);
        let h = harness_with_disk(usize::MAX, all_stages(), tier.provider());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame(&h.budget));
        assert_eq!(tier.writes(), 1);
        h.cache.cleanup();

        // The duplicate check inside put already read the tier once.
        let baseline = tier.reads();

        let mut speculative = ctx();
        speculative.for_render = true;
        assert!(h
            .cache
            .get(&speculative, &strip, 10.0, CacheStage::Composite)
            .is_none());
        assert_eq!(tier.reads(), baseline, "for-render misses are final");

        // A normal lookup faults it back in.
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::Composite).is_some());
        assert_eq!(tier.reads(), baseline + 1);
        assert_eq!(h.cache.stats().disk_hits(), 1);
        assert_eq!(h.cache.len(), 1, "disk hit is pulled back into RAM");

        // The reinserted entry serves the next lookup without disk traffic.
        assert!(h.cache.get(&ctx(), &strip, 10.0, CacheStage::Composite).is_some());
        assert_eq!(tier.reads(), baseline + 1);
    }

    #[test]
    fn test_final_disk_hit_needs_room_to_reinsert() {
        let tier_budget = MemoryBudget::new(usize::MAX);
        let tier = StubTier::new(&tier_budget);
        let h = harness_with_disk(usize::MAX, all_stages(), tier.provider());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache.cleanup();

        // Nothing evictable and no room: the frame is served from disk but
        // not reinserted.
        h.budget.set_limit(0);
        let _held = frame(&h.budget);
        let got = h.cache.get(&ctx(), &strip, 10.0, CacheStage::FinalOutput);
        assert!(got.is_some());
        assert!(h.cache.is_empty());

        // With room available the reinsert happens.
        h.budget.set_limit(usize::MAX);
        let got = h.cache.get(&ctx(), &strip, 10.0, CacheStage::FinalOutput);
        assert!(got.is_some());
        assert_eq!(h.cache.len(), 1);
    }

    #[test]
    fn test_stage_override_replaces_session_selection() {
        let tier_budget = MemoryBudget::new(usize::MAX);
        let tier = StubTier::new(&tier_budget);
        let settings = CacheSettings {
            stored_stages: StageMask::RAW | StageMask::FINAL_OUTPUT,
            prefetch_enabled: false,
        };
        let h = harness_with_disk(usize::MAX, settings, tier.provider());
        let strip = Strip::clip("clip", 0, 100, 0, 99);
        strip.set_stage_override(Some(StageMask::COMPOSITE));

        // Raw is stored by the session but overridden away for this strip.
        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Raw, frame(&h.budget));
        assert_eq!(tier.writes(), 0);

        // Composite comes from the override.
        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::Composite, frame(&h.budget));
        assert_eq!(tier.writes(), 1);

        // FinalOutput cannot be overridden away.
        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        assert_eq!(tier.writes(), 2);
    }

    #[test]
    fn test_invalidate_reaches_only_created_tier() {
        let tier_budget = MemoryBudget::new(usize::MAX);
        let tier = StubTier::new(&tier_budget);
        let h = harness_with_disk(usize::MAX, all_stages(), tier.provider());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        // No disk op has run yet; invalidation must not spin the tier up.
        h.cache.invalidate(&strip, &strip, StageMask::all(), false);
        assert_eq!(tier.invalidations(), 0);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame(&h.budget));
        h.cache.invalidate(&strip, &strip, StageMask::all(), false);
        assert_eq!(tier.invalidations(), 1);
    }

    #[test]
    fn test_evicted_buffer_survives_while_held() {
        let h = harness(usize::MAX, all_stages());
        let strip = Strip::clip("clip", 0, 100, 0, 99);

        h.cache
            .put(&ctx(), &strip, 10.0, CacheStage::FinalOutput, frame_with(&h.budget, 9));
        let held = h
            .cache
            .get(&ctx(), &strip, 10.0, CacheStage::FinalOutput)
            .unwrap();

        h.cache.cleanup();
        assert!(h.cache.is_empty());
        assert_eq!(h.budget.bytes_in_use(), FRAME_BYTES, "held bytes stay charged");
        assert_eq!(held.data()[0], 9);

        drop(held);
        assert_eq!(h.budget.bytes_in_use(), 0);
    }

    #[test]
    fn test_concurrent_puts_and_gets() {
        let h = harness(FRAME_BYTES * 32, all_stages());
        let strip = Strip::clip("clip", 0, 1000, 0, 999);
        let cache = &h.cache;
        let budget = &h.budget;

        std::thread::scope(|scope| {
            for t in 0..4 {
                let strip = Arc::clone(&strip);
                scope.spawn(move || {
                    for i in 0..50 {
                        let tf = (t * 50 + i) as f32;
                        cache.put_if_possible(
                            &ctx(),
                            &strip,
                            tf,
                            CacheStage::FinalOutput,
                            frame(budget),
                        );
                        cache.get(&ctx(), &strip, tf, CacheStage::FinalOutput);
                    }
                });
            }
        });

        assert!(cache.recycle());
        assert!(!cache.is_over_budget());
        h.cache.assert_chain_consistent();
    }
}
