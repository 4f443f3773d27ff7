//! Playback workload driver for the reelstore frame cache

mod render;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use reelcache::{
    CacheSettings, FrameCache, MemoryBudget, PrefetchStatus, RenderContext, StageMask, Strip,
    TaskId,
};
use reeldisk::DiskStore;

use crate::render::{expected_final_fill, RenderPath, Renderer};

const SESSION_ID: u64 = 1;
const MIB: f64 = 1024.0 * 1024.0;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Timeline length in frames
    #[arg(long, default_value_t = 360)]
    frames: i32,

    /// Number of clip strips laid across the timeline
    #[arg(long, default_value_t = 6)]
    strips: usize,

    /// Frame width in pixels
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 180)]
    height: u32,

    /// RAM budget in MiB
    #[arg(long, default_value_t = 64)]
    budget_mib: usize,

    /// Playback passes over the timeline
    #[arg(long, default_value_t = 3)]
    loops: usize,

    /// Keep raw decodes in the cache alongside final frames
    #[arg(long)]
    store_raw: bool,

    /// Run a prefetch thread rendering ahead of the playhead
    #[arg(long)]
    prefetch: bool,

    /// How far ahead the prefetch thread renders
    #[arg(long, default_value_t = 48)]
    prefetch_ahead: i32,

    /// Directory for the spill tier; RAM-only when omitted
    #[arg(long)]
    disk_dir: Option<PathBuf>,

    /// Spill tier payload limit in MiB
    #[arg(long, default_value_t = 256)]
    disk_limit_mib: u64,

    /// Trim one strip and invalidate its frames after this playback pass
    #[arg(long)]
    edit_after_pass: Option<usize>,

    /// Simulated decode cost per rendered frame, in microseconds
    #[arg(long, default_value_t = 0)]
    render_cost_us: u64,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.strips > 0, "--strips must be at least 1");
    anyhow::ensure!(
        args.frames >= args.strips as i32,
        "--frames must cover every strip"
    );

    info!("Starting reelsim v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Timeline: {} frames across {} strips, {} passes",
        args.frames, args.strips, args.loops
    );

    let budget = MemoryBudget::new(args.budget_mib * 1024 * 1024);
    let prefetch_status = PrefetchStatus::new();
    let renderer = Arc::new(Renderer::new(args.width, args.height, args.render_cost_us));
    info!(
        "Budget: {} MiB RAM, roughly {} frames",
        args.budget_mib,
        args.budget_mib * 1024 * 1024 / renderer.frame_bytes().max(1)
    );

    let mut stored_stages = StageMask::FINAL_OUTPUT;
    if args.store_raw {
        stored_stages |= StageMask::RAW;
    }
    let settings = CacheSettings {
        stored_stages,
        prefetch_enabled: args.prefetch,
    };

    let disk = args.disk_dir.clone().map(|dir| {
        info!("Spill tier at {}", dir.display());
        DiskStore::provider(dir, Arc::clone(&budget), args.disk_limit_mib * 1024 * 1024)
    });

    let cache = Arc::new(FrameCache::new(
        Arc::clone(&budget),
        Arc::clone(&prefetch_status),
        settings,
        disk,
    ));
    let timeline = Arc::new(build_timeline(args.frames, args.strips));
    let ctx = RenderContext::new(SESSION_ID, args.width, args.height);

    let done = Arc::new(AtomicBool::new(false));
    let prefetch_handle = if args.prefetch {
        let mut prefetch_ctx = ctx.clone();
        prefetch_ctx.task_id = TaskId::PREFETCH_RENDER;
        let worker = PrefetchWorker {
            cache: Arc::clone(&cache),
            renderer: Arc::clone(&renderer),
            timeline: Arc::clone(&timeline),
            status: Arc::clone(&prefetch_status),
            done: Arc::clone(&done),
            ahead: args.prefetch_ahead,
            last_frame: args.frames - 1,
            ctx: prefetch_ctx,
        };
        Some(thread::spawn(move || worker.run()))
    } else {
        None
    };

    let started = Instant::now();
    let mut served = 0u64;
    let mut cold = 0u64;
    for pass in 1..=args.loops {
        for frame in 0..args.frames {
            cache.set_playhead(frame);
            let strip = active_strip(&timeline, frame);
            let (shown, path) = renderer.pipeline(&cache, &ctx, strip, frame);

            let expected = expected_final_fill(strip, frame);
            if shown.data().first().copied() != Some(expected) {
                warn!(
                    "Frame {} shows fill {:?}, expected {}",
                    frame,
                    shown.data().first(),
                    expected
                );
            }

            served += 1;
            if path == RenderPath::Cold {
                cold += 1;
            }
            cache.free_temp_cache(TaskId::MAIN_RENDER, frame);
        }

        let stats = cache.stats();
        info!(
            "Pass {}/{}: hit ratio {:.1}%, {} entries live, {:.1} MiB in use",
            pass,
            args.loops,
            stats.hit_ratio() * 100.0,
            cache.len(),
            budget.bytes_in_use() as f64 / MIB,
        );

        if args.edit_after_pass == Some(pass) {
            apply_edit(&cache, &timeline);
        }
    }

    done.store(true, Ordering::Relaxed);
    prefetch_status.stop();
    let prefetched = match prefetch_handle {
        Some(handle) => handle.join().unwrap_or(0),
        None => 0,
    };

    report(&cache, served, cold, prefetched, started.elapsed());

    cache.cleanup();
    info!(
        "Cleanup done: {} entries, {:.1} MiB in use",
        cache.len(),
        budget.bytes_in_use() as f64 / MIB
    );

    Ok(())
}

/// Clips laid end to end with a small overlap, covering the whole timeline.
fn build_timeline(frames: i32, strips: usize) -> Vec<Arc<Strip>> {
    const OVERLAP: i32 = 4;
    let seg = (frames + strips as i32 - 1) / strips as i32;
    (0..strips as i32)
        .map(|i| {
            let left = (i * seg - OVERLAP).max(0);
            let right = ((i + 1) * seg - 1 + OVERLAP).min(frames - 1);
            let start = i * seg;
            let media_length = right - start + 1;
            Strip::clip(format!("clip.{:03}", i), start, media_length, left, right)
        })
        .collect()
}

/// Topmost strip playing at `frame`.
fn active_strip(timeline: &[Arc<Strip>], frame: i32) -> &Arc<Strip> {
    timeline
        .iter()
        .rev()
        .find(|strip| strip.contains_frame(frame))
        .unwrap_or_else(|| &timeline[timeline.len() - 1])
}

/// Trim a strip's tail and drop the frames it affected, while the handles
/// still cover the range being removed.
fn apply_edit(cache: &FrameCache, timeline: &[Arc<Strip>]) {
    let strip = &timeline[timeline.len() / 2];
    let span = strip.right_handle() - strip.left_handle();
    let new_right = strip.right_handle() - span / 4;

    cache.invalidate(
        strip,
        strip,
        StageMask::SOURCE | StageMask::FINAL_OUTPUT,
        false,
    );
    strip.set_right_handle(new_right);
    info!(
        "Edit: trimmed '{}' to [{}, {}]",
        strip.name(),
        strip.left_handle(),
        new_right
    );
}

/// Renders ahead of the playhead and publishes its range so eviction spares
/// the frames playback is about to need.
struct PrefetchWorker {
    cache: Arc<FrameCache>,
    renderer: Arc<Renderer>,
    timeline: Arc<Vec<Arc<Strip>>>,
    status: Arc<PrefetchStatus>,
    done: Arc<AtomicBool>,
    ahead: i32,
    last_frame: i32,
    ctx: RenderContext,
}

impl PrefetchWorker {
    fn run(self) -> u64 {
        let mut rendered = 0u64;
        let playhead = self.cache.playhead();
        self.status
            .begin(playhead, (playhead + self.ahead).min(self.last_frame));

        while !self.done.load(Ordering::Relaxed) && !self.status.is_stop_requested() {
            let playhead = self.cache.playhead();
            let end = (playhead + self.ahead).min(self.last_frame);
            self.status.set_range(playhead, end);

            let mut idle = true;
            for frame in playhead..=end {
                if self.done.load(Ordering::Relaxed) || self.status.is_stop_requested() {
                    break;
                }
                let strip = active_strip(&self.timeline, frame);
                let (_, path) = self.renderer.pipeline(&self.cache, &self.ctx, strip, frame);
                if path != RenderPath::CachedFinal {
                    rendered += 1;
                    idle = false;
                }
            }
            if idle {
                thread::sleep(Duration::from_millis(1));
            }
        }

        self.status.finish();
        rendered
    }
}

fn report(cache: &FrameCache, served: u64, cold: u64, prefetched: u64, elapsed: Duration) {
    let stats = cache.stats();
    let budget = cache.budget();

    let mut live = 0usize;
    let mut per_stage = [0u64; 4];
    cache.iterate(
        |len| {
            live = len;
            false
        },
        |_, _, stage| {
            per_stage[stage.code() as usize] += 1;
            false
        },
    );

    println!();
    println!("╔════════════════════════════════════════╗");
    println!("║           reelsim run summary          ║");
    println!("╚════════════════════════════════════════╝");
    println!("  Frames served:      {}", served);
    println!("  Cold renders:       {}", cold);
    println!("  Prefetch renders:   {}", prefetched);
    println!(
        "  RAM hits/misses:    {} / {}  ({:.1}% hit ratio)",
        stats.hits(),
        stats.misses(),
        stats.hit_ratio() * 100.0
    );
    println!(
        "  Disk hits/writes:   {} / {}",
        stats.disk_hits(),
        stats.disk_writes()
    );
    println!(
        "  Inserts/evictions:  {} / {}",
        stats.inserts(),
        stats.evictions()
    );
    println!(
        "  Entries live:       {}  (raw {}, pre {}, comp {}, final {})",
        live, per_stage[0], per_stage[1], per_stage[2], per_stage[3]
    );
    println!(
        "  RAM in use:         {:.1} / {:.1} MiB",
        budget.bytes_in_use() as f64 / MIB,
        budget.limit() as f64 / MIB
    );
    println!("  Elapsed:            {:.2}s", elapsed.as_secs_f64());
    println!();
}
