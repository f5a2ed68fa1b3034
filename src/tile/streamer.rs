//! Viewport-driven tile scheduling.
//!
//! [`TileStreamer::service`] is called once per frame. Each pass walks the
//! unfinished levels from coarse to fine and issues a bounded amount of
//! work for the tiles the viewport needs:
//!
//! ```text
//!  viewport ─► visible rect ─► neighbors lacking H ─► chunk list
//!                   │                 │                   │
//!                   │                 │    resident? ──no──► async read
//!                   │                 │         │yes
//!                   │                 │  H decompress (worker or inline)
//!                   │                 ▼
//!                   │    lacking LL under a loaded parent ─► rebuild parent
//!                   ▼
//!        ready tiles with ready neighbors ─► load (worker) ─► TileSink
//! ```
//!
//! A pass never blocks. Work that cannot be issued now is picked up by a
//! later pass, so the caller keeps calling `service` until
//! [`PassReport::is_settled`].
//!
//! # Frame boundaries
//!
//! The frame counter advances whenever the viewport changes (or the caller
//! calls [`TileStreamer::advance_frame`] from another thread). A pass that
//! sees the counter move skips inline decompression but keeps handing work
//! to the queue, and stops after the next load it submits; tasks that were
//! already submitted still complete, since their result depends only on tile
//! identity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, error};

use super::loader::TileLoader;
use super::queue::{TileSink, WorkQueue};
use super::loader::{Donation, LoadClaim};
use super::state::{FAILED, HAS_H, HAS_LL, H_CLAIMED, LOADED, LOAD_CLAIMED};
use crate::config::StreamerConfig;
use crate::format::isyntax::layout::{Bounds, LevelLayout, TileRect};

/// How long `settle` waits for progress before starting another pass.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Viewport
// =============================================================================

/// What the renderer currently shows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Visible region in microns
    pub bounds: Bounds,

    /// Finest scale to service (0 = full resolution)
    pub scale: u32,

    /// Optional region outside of which nothing is loaded
    pub crop: Option<Bounds>,
}

impl Viewport {
    pub fn new(bounds: Bounds, scale: u32) -> Self {
        Self {
            bounds,
            scale,
            crop: None,
        }
    }

    pub fn with_crop(mut self, crop: Bounds) -> Self {
        self.crop = Some(crop);
        self
    }

    /// Tiles of `layout` the renderer wants, plus one ring.
    ///
    /// The extra ring makes every neighbor of a visible tile at the next
    /// finer scale a child of a tile loaded here.
    pub fn visible_tiles(&self, layout: &LevelLayout) -> TileRect {
        let mut wanted = layout.tiles_in_bounds(&self.bounds);
        if let Some(crop) = &self.crop {
            wanted = wanted.clip(&layout.tiles_in_bounds(crop));
        }
        if wanted.is_empty() {
            return TileRect::default();
        }
        wanted.expand(1).clip(&layout.bounds())
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// Work issued by one `service` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Levels that were not yet complete
    pub scales_serviced: u32,
    /// Chunk reads started
    pub chunk_reads: u32,
    /// Decompressions handed to the work queue
    pub h_submitted: u32,
    /// Decompressions run on the calling thread
    pub h_inline: u32,
    /// Tile loads handed to the work queue
    pub loads_submitted: u32,
    /// Parent rebuilds started to restore missing low-pass data
    pub low_pass_requests: u32,
    /// Visible tiles neither loaded nor failed
    pub visible_pending: u32,
    /// The pass stopped early at a frame boundary
    pub interrupted: bool,
}

impl PassReport {
    /// Total work items issued.
    pub fn work_issued(&self) -> u32 {
        self.chunk_reads + self.h_submitted + self.h_inline + self.loads_submitted + self.low_pass_requests
    }

    /// Nothing was issued and every visible tile is finished.
    pub fn is_settled(&self) -> bool {
        self.work_issued() == 0 && self.visible_pending == 0 && !self.interrupted
    }
}

// =============================================================================
// Tile Streamer
// =============================================================================

/// Per-frame scheduler for one slide.
pub struct TileStreamer {
    loader: Arc<TileLoader>,
    queue: Arc<dyn WorkQueue>,
    sink: Arc<dyn TileSink>,

    /// Runtime for chunk reads started from `service`
    runtime: Handle,

    max_chunks_per_pass: usize,
    decompress_backlog_factor: usize,
    load_backlog_factor: usize,

    frame: AtomicU64,
    last_viewport: Mutex<Option<Viewport>>,

    /// Chunks with a read in flight
    pending_reads: Arc<Mutex<HashSet<u32>>>,

    /// Tiles with a low-pass restore in flight
    pending_low_pass: Arc<Mutex<HashSet<(u32, i32, i32)>>>,

    /// First-load tiles were handed to the sink
    replayed: AtomicBool,
}

impl TileStreamer {
    pub fn new(
        loader: Arc<TileLoader>,
        queue: Arc<dyn WorkQueue>,
        sink: Arc<dyn TileSink>,
        runtime: Handle,
        config: &StreamerConfig,
    ) -> Self {
        Self {
            loader,
            queue,
            sink,
            runtime,
            max_chunks_per_pass: config.max_chunks_per_pass.max(1),
            decompress_backlog_factor: config.decompress_backlog_factor,
            load_backlog_factor: config.load_backlog_factor,
            frame: AtomicU64::new(0),
            last_viewport: Mutex::new(None),
            pending_reads: Arc::new(Mutex::new(HashSet::new())),
            pending_low_pass: Arc::new(Mutex::new(HashSet::new())),
            replayed: AtomicBool::new(false),
        }
    }

    pub fn loader(&self) -> &Arc<TileLoader> {
        &self.loader
    }

    /// Current frame number.
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Mark the current frame as superseded.
    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Chunk reads still in flight.
    pub fn pending_reads(&self) -> usize {
        self.pending_reads.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Run one scheduling pass for `viewport`.
    pub fn service(&self, viewport: &Viewport) -> PassReport {
        let mut report = PassReport::default();

        if !self.replayed.swap(true, Ordering::AcqRel) {
            let tiles = self.loader.take_first_loaded();
            debug!("streamer: replaying {} tiles from the first load", tiles.len());
            for tile in tiles {
                self.sink.deliver(tile);
            }
        }

        if let Ok(mut last) = self.last_viewport.lock() {
            if last.as_ref() != Some(viewport) {
                *last = Some(*viewport);
                self.advance_frame();
            }
        }
        let frame = self.frame();
        let boundary_passed = || self.frame() != frame;

        let store = self.loader.store();
        let max_scale = store.max_scale();
        let zoom = viewport.scale.min(max_scale);
        let workers = self.queue.worker_count().max(1);
        let mut chunk_list: Vec<u32> = Vec::with_capacity(self.max_chunks_per_pass);
        let mut resident: HashMap<u32, Bytes> = HashMap::new();

        'scales: for scale in (zoom..=max_scale).rev() {
            let Some(level) = self.loader.level_state(scale) else {
                continue;
            };
            if level.is_complete() {
                continue;
            }
            let Some(layout) = store.level(scale) else {
                continue;
            };
            report.scales_serviced += 1;

            let visible = viewport.visible_tiles(layout);

            // Neighbors the unfinished visible tiles depend on
            let mut need_h = Vec::new();
            let mut seen = HashSet::new();
            for (x, y) in visible.iter() {
                let Some(state) = self.loader.tile_state(scale, x, y) else {
                    continue;
                };
                if state.is_done() {
                    continue;
                }
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let (nx, ny) = (x + dx, y + dy);
                        let Some(neighbor) = self.loader.tile_state(scale, nx, ny) else {
                            continue;
                        };
                        let flags = neighbor.flags();
                        if flags & FAILED != 0 {
                            continue;
                        }
                        if flags & (HAS_H | H_CLAIMED) == 0 && seen.insert((nx, ny)) {
                            need_h.push((nx, ny));
                        }
                        // Low-pass data that was reclaimed, or never donated,
                        // has to come from the loaded parent again
                        if flags & HAS_LL == 0 && scale < max_scale {
                            let parent_loaded = self
                                .loader
                                .tile_state(scale + 1, nx.div_euclid(2), ny.div_euclid(2))
                                .map_or(false, |p| p.flags() & (LOADED | LOAD_CLAIMED) == LOADED);
                            if parent_loaded && self.request_low_pass(scale, nx, ny) {
                                report.low_pass_requests += 1;
                            }
                        }
                    }
                }
            }

            for &(x, y) in &need_h {
                let Some(chunk) = layout.tile(x, y).map(|t| t.chunk) else {
                    continue;
                };
                if !chunk_list.contains(&chunk) {
                    if chunk_list.len() >= self.max_chunks_per_pass {
                        continue;
                    }
                    chunk_list.push(chunk);
                    match self.loader.chunk_cache().try_get(chunk) {
                        Some(data) => {
                            resident.insert(chunk, data);
                        }
                        None => {
                            if self.request_chunk(chunk) {
                                report.chunk_reads += 1;
                            }
                        }
                    }
                }
                let Some(data) = resident.get(&chunk) else {
                    continue;
                };
                let Some(state) = self.loader.tile_state(scale, x, y) else {
                    continue;
                };
                if !state.claim(H_CLAIMED, HAS_H) {
                    continue;
                }

                if self.queue.idle_worker_count() > 0
                    && self.queue.pending_count() < workers * self.decompress_backlog_factor
                {
                    let loader = Arc::clone(&self.loader);
                    let data = data.clone();
                    if self
                        .queue
                        .submit(Box::new(move || loader.run_h_task(scale, x, y, &data)))
                    {
                        report.h_submitted += 1;
                        continue;
                    }
                }

                // Past the frame boundary only queued work is issued
                if boundary_passed() {
                    state.clear(H_CLAIMED);
                    report.interrupted = true;
                    continue;
                }
                self.loader.run_h_task(scale, x, y, data);
                report.h_inline += 1;
            }

            for (x, y) in visible.iter() {
                let Some(state) = self.loader.tile_state(scale, x, y) else {
                    continue;
                };
                if state.is_done() || state.has(LOAD_CLAIMED) {
                    continue;
                }
                if !self.loader.neighborhood_ready(scale, x, y) {
                    continue;
                }
                if self.loader.claim_load(scale, x, y, LOADED) != LoadClaim::Claimed {
                    continue;
                }
                let loader = Arc::clone(&self.loader);
                let sink = Arc::clone(&self.sink);
                if !self.queue.submit(Box::new(move || {
                    loader.run_load_task(scale, x, y, Some(sink.as_ref()), &Donation::Needed);
                })) {
                    self.loader.abandon_load(scale, x, y);
                    break 'scales;
                }
                report.loads_submitted += 1;

                if boundary_passed() {
                    report.interrupted = true;
                    break 'scales;
                }
                if self.queue.pending_count() > workers * self.load_backlog_factor {
                    break 'scales;
                }
            }
        }

        report.visible_pending = self.count_visible_pending(viewport, zoom);
        report
    }

    /// Unfinished visible tiles over every incomplete level down to `zoom`.
    fn count_visible_pending(&self, viewport: &Viewport, zoom: u32) -> u32 {
        let store = self.loader.store();
        let mut pending = 0;
        for scale in zoom..=store.max_scale() {
            let (Some(layout), Some(level)) = (store.level(scale), self.loader.level_state(scale)) else {
                continue;
            };
            if level.is_complete() {
                continue;
            }
            for (x, y) in viewport.visible_tiles(layout).iter() {
                if let Some(state) = self.loader.tile_state(scale, x, y) {
                    if !state.is_done() {
                        pending += 1;
                    }
                }
            }
        }
        pending
    }

    /// Start reading chunk `index` unless a read is already in flight.
    fn request_chunk(&self, index: u32) -> bool {
        match self.pending_reads.lock() {
            Ok(mut pending) => {
                if !pending.insert(index) {
                    return false;
                }
            }
            Err(_) => return false,
        }

        let loader = Arc::clone(&self.loader);
        let pending = Arc::clone(&self.pending_reads);
        self.runtime.spawn(async move {
            if let Err(e) = loader.load_chunk(index).await {
                error!("Chunk {} read failed: {}", index, e);
                loader.fail_chunk(index, "chunk read failed");
            }
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&index);
            }
            loader.notify_progress();
        });
        true
    }

    /// Rebuild the loaded parent of tile (`x`, `y`) so it gets low-pass data
    /// again, unless that is already under way.
    fn request_low_pass(&self, scale: u32, x: i32, y: i32) -> bool {
        match self.pending_low_pass.lock() {
            Ok(mut pending) => {
                if !pending.insert((scale, x, y)) {
                    return false;
                }
            }
            Err(_) => return false,
        }

        let loader = Arc::clone(&self.loader);
        let pending = Arc::clone(&self.pending_low_pass);
        self.runtime.spawn(async move {
            if !loader.restore_low_pass(scale, x, y).await {
                debug!("streamer: low-pass of tile ({}, {}) of level {} not restored yet", x, y, scale);
            }
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&(scale, x, y));
            }
            loader.notify_progress();
        });
        true
    }

    /// Call `service` until the viewport settles.
    ///
    /// Between passes waits for worker progress. Returns the number of
    /// passes, or `None` if `max_passes` ran out first.
    pub async fn settle(&self, viewport: &Viewport, max_passes: usize) -> Option<usize> {
        for pass in 1..=max_passes {
            let notified = self.loader.progress().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let report = self.service(viewport);
            if report.is_settled() {
                return Some(pass);
            }
            if report.work_issued() == 0 {
                let _ = tokio::time::timeout(SETTLE_POLL_INTERVAL, notified).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        None
    }
}

impl std::fmt::Debug for TileStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileStreamer")
            .field("loader", &self.loader)
            .field("frame", &self.frame())
            .field("max_chunks_per_pass", &self.max_chunks_per_pass)
            .finish()
    }
}
