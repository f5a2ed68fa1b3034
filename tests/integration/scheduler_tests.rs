//! Viewport streaming tests.
//!
//! These tests drive `TileStreamer` the way a renderer would and check:
//! - Every visible tile is delivered exactly once, with exact pixels
//! - No tile is ever loaded before its neighborhood is ready
//! - Repeated passes over a settled viewport issue no work
//! - Chunks are read once and coefficient memory is released
//! - Cropping and zoom limit the work to what is shown
//! - Frame boundaries skip inline work without dropping queued loads
//! - Missing low-pass data under a loaded parent is restored

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use isyntax_streamer::tile::{Task, HAS_H, HAS_LL, H_CLAIMED, LOADED};
use isyntax_streamer::{
    Bounds, CollectingSink, CompletedTile, InlineQueue, IsyntaxSlide, TileStreamer, Viewport, WorkQueue,
    WorkerPool,
};

use super::test_utils::{open_synthetic, test_config, SyntheticSlide, SyntheticSlideBuilder};

const MAX_PASSES: usize = 10_000;

fn full_viewport(slide: &IsyntaxSlide, scale: u32) -> Viewport {
    slide.viewport(slide.bounds(), scale)
}

/// Check delivered tiles for duplicates and exact pixels; returns their keys.
fn check_delivered(tiles: &[CompletedTile], synthetic: &SyntheticSlide) -> HashSet<(u32, u32, u32)> {
    let mut keys = HashSet::new();
    for tile in tiles {
        let key = (tile.level, tile.tile_x, tile.tile_y);
        assert!(keys.insert(key), "tile {:?} delivered twice", key);
        assert!(
            tile.bgra.as_ref()
                == synthetic
                    .expected_bgra(tile.level, tile.tile_x as usize, tile.tile_y as usize)
                    .as_slice(),
            "tile {:?} differs",
            key
        );
    }
    keys
}

/// Wait until the pool has drained its queue.
async fn drain(pool: &WorkerPool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while pool.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("worker pool did not drain");
}

/// Small xorshift generator for reproducible viewports.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }

    fn below(&mut self, bound: u32) -> u32 {
        self.next() % bound.max(1)
    }
}

fn random_viewport(rng: &mut Rng, slide: &IsyntaxSlide, synthetic: &SyntheticSlide) -> Viewport {
    let scale = rng.below(synthetic.levels);
    let side = synthetic.tile_side_um(scale);
    let (tiles_x, tiles_y) = synthetic.tiles_at(scale);
    let w = 1 + rng.below(3);
    let h = 1 + rng.below(3);
    let x = rng.below(tiles_x as u32) as f64 * side + f64::from(rng.below(8)) * side / 8.0;
    let y = rng.below(tiles_y as u32) as f64 * side;
    slide.viewport(
        Bounds::new(x, y, x + f64::from(w) * side, y + f64::from(h) * side),
        scale,
    )
}

// =============================================================================
// Inline Queue
// =============================================================================

#[tokio::test]
async fn test_full_viewport_settles_inline() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    let passes = streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await;
    assert!(passes.is_some(), "viewport did not settle");

    let keys = check_delivered(&sink.take(), &synthetic);
    // 16x8 + 8x4 + 4x2 + 2x1, top level replayed from the first load
    assert_eq!(keys.len(), 128 + 32 + 8 + 2);
    assert_eq!(slide.loader().readiness_violations(), 0);
    for scale in 0..4 {
        assert!(slide.loader().level_state(scale).unwrap().is_complete());
    }
}

#[tokio::test]
async fn test_settled_viewport_is_a_fixed_point() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    let viewport = slide.viewport(Bounds::new(10.0, 5.0, 30.0, 20.0), 1);
    assert!(streamer.settle(&viewport, MAX_PASSES).await.is_some());
    let delivered = sink.len();

    for _ in 0..5 {
        let report = streamer.service(&viewport);
        assert_eq!(report.work_issued(), 0);
        assert_eq!(report.visible_pending, 0);
        assert!(report.is_settled());
    }
    assert_eq!(sink.len(), delivered);
}

#[tokio::test]
async fn test_first_pass_never_blocks_on_reads() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    // Nothing below the top level is resident yet: the pass can only start reads
    let report = streamer.service(&full_viewport(&slide, 0));
    assert!(report.chunk_reads > 0);
    assert!(report.chunk_reads as usize <= test_config().max_chunks_per_pass);
    assert_eq!(report.loads_submitted, 0);
    assert!(report.visible_pending > 0);
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_zoomed_out_viewport_leaves_fine_levels_alone() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    assert!(streamer.settle(&full_viewport(&slide, 2), MAX_PASSES).await.is_some());

    let keys = check_delivered(&sink.take(), &synthetic);
    assert!(keys.iter().all(|&(level, _, _)| level >= 2));
    let loader = slide.loader();
    assert!(loader.level_state(2).unwrap().is_complete());
    assert_eq!(loader.level_state(0).unwrap().done_count(), 0);
    assert!(loader
        .level_state(0)
        .unwrap()
        .tiles
        .iter()
        .all(|t| !t.has(HAS_H)));
}

#[tokio::test]
async fn test_crop_limits_loaded_tiles() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    // The left quarter of the image: level-0 tiles 0..4
    let side = synthetic.tile_side_um(0);
    let crop = Bounds::new(0.0, 0.0, 4.0 * side, 8.0 * side);
    let viewport = full_viewport(&slide, 0).with_crop(crop);
    assert!(streamer.settle(&viewport, MAX_PASSES).await.is_some());

    let keys = check_delivered(&sink.take(), &synthetic);
    let level0: Vec<u32> = keys.iter().filter(|k| k.0 == 0).map(|k| k.1).collect();
    assert!(!level0.is_empty());
    // One ring beyond the crop at most
    assert!(level0.iter().all(|&x| x <= 4));
    for x in 0..4 {
        for y in 0..8 {
            assert!(keys.contains(&(0, x, y)), "tile ({}, {}) missing", x, y);
        }
    }
}

#[tokio::test]
async fn test_chunks_are_read_once() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, reader) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());
    assert_eq!(streamer.pending_reads(), 0);

    for &(offset, _) in &synthetic.chunk_ranges {
        assert_eq!(reader.reads_at(offset).await, 1, "chunk at {}", offset);
    }
}

#[tokio::test]
async fn test_coefficient_memory_released() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());

    let loader = slide.loader();
    for scale in 0..4 {
        let level = loader.level_state(scale).unwrap();
        assert!(level.tiles.iter().all(|t| t.flags() & (HAS_H | HAS_LL) == 0), "level {}", scale);
    }
    assert_eq!(loader.pools().h.in_use(), 0);
    assert_eq!(loader.pools().ll.in_use(), 0);
}

#[tokio::test]
async fn test_failed_chunk_does_not_stall_streaming() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (offset, size) = synthetic.chunk_ranges[5];
    let reader = synthetic.reader().with_failing_range(offset, size);
    let slide = IsyntaxSlide::open(Arc::new(reader), &test_config()).await.unwrap();
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());

    // Chunk 5 holds scale-2 tile (3, 0) and everything below it
    let keys = check_delivered_loosely(&sink.take());
    assert!(!keys.contains(&(2, 3, 0)));
    assert!(!keys.contains(&(0, 15, 0)));
    assert!(keys.contains(&(0, 0, 7)));
    assert_eq!(slide.loader().readiness_violations(), 0);
}

/// Keys of delivered tiles, without comparing pixels.
fn check_delivered_loosely(tiles: &[CompletedTile]) -> HashSet<(u32, u32, u32)> {
    let mut keys = HashSet::new();
    for tile in tiles {
        assert!(keys.insert((tile.level, tile.tile_x, tile.tile_y)));
    }
    keys
}

#[tokio::test]
async fn test_high_pass_stays_next_to_visible_tiles() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    // Inside level-1 tile (3, 1): visible tiles are x 2..=4, their
    // neighborhoods end at x 1 and x 5
    let side = synthetic.tile_side_um(1);
    let viewport = slide.viewport(
        Bounds::new(3.25 * side, 1.25 * side, 3.75 * side, 1.75 * side),
        1,
    );
    assert!(streamer.settle(&viewport, MAX_PASSES).await.is_some());

    let loader = slide.loader();
    for y in 0..4 {
        for x in [0, 6, 7] {
            let state = loader.tile_state(1, x, y).unwrap();
            assert_eq!(state.flags() & (HAS_H | H_CLAIMED), 0, "tile ({}, {})", x, y);
        }
    }
    assert!(loader.tile_state(1, 3, 1).unwrap().has(LOADED));
}

/// Runs tasks inline but never reports an idle worker, so decompression
/// happens on the servicing thread. The frame is superseded on the
/// `bump_at`-th idle query.
struct FrameBumpingQueue {
    streamer: OnceLock<Weak<TileStreamer>>,
    queries: AtomicUsize,
    bump_at: usize,
}

impl WorkQueue for FrameBumpingQueue {
    fn submit(&self, task: Task) -> bool {
        task();
        true
    }

    fn pending_count(&self) -> usize {
        0
    }

    fn idle_worker_count(&self) -> usize {
        if self.queries.fetch_add(1, Ordering::SeqCst) + 1 == self.bump_at {
            if let Some(streamer) = self.streamer.get().and_then(Weak::upgrade) {
                streamer.advance_frame();
            }
        }
        0
    }

    fn worker_count(&self) -> usize {
        1
    }
}

#[tokio::test]
async fn test_frame_boundary_skips_inline_work_but_still_loads() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = isyntax_streamer::StreamerConfig {
        max_chunks_per_pass: 8,
        ..test_config()
    };
    let (slide, _) = open_synthetic(&synthetic, &config).await;
    let queue = Arc::new(FrameBumpingQueue {
        streamer: OnceLock::new(),
        queries: AtomicUsize::new(0),
        bump_at: 8,
    });
    let sink = Arc::new(CollectingSink::new());
    let streamer = Arc::new(slide.streamer(queue.clone(), sink.clone()));
    queue.streamer.set(Arc::downgrade(&streamer)).unwrap();
    let viewport = full_viewport(&slide, 2);

    // First pass only starts the reads of the eight scale-2 chunks
    let report = streamer.service(&viewport);
    assert_eq!(report.chunk_reads, 8);
    tokio::time::timeout(Duration::from_secs(10), async {
        while streamer.pending_reads() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("reads did not finish");

    // The eighth decompression, tile (3, 1), falls past the boundary
    let report = streamer.service(&viewport);
    assert!(report.interrupted);
    assert_eq!(report.h_inline, 7);
    assert_eq!(report.loads_submitted, 1);
    let loader = slide.loader();
    assert_eq!(loader.tile_state(2, 3, 1).unwrap().flags() & (HAS_H | H_CLAIMED), 0);
    assert!(loader.tile_state(2, 0, 0).unwrap().has(LOADED));

    assert!(streamer.settle(&viewport, MAX_PASSES).await.is_some());
    let keys = check_delivered(&sink.take(), &synthetic);
    assert_eq!(keys.len(), 8 + 2);
    assert_eq!(loader.readiness_violations(), 0);
}

#[tokio::test]
async fn test_streamer_restores_low_pass_under_loaded_parents() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let loader = slide.loader();

    // The force path gives low-pass data only to the tiles its request reads:
    // parent (1, 1) of level 0 is loaded, its child (2, 2) gets nothing
    assert!(slide.decode_tile(0, 4, 4).await.unwrap().pixels().is_some());
    assert!(loader.tile_state(1, 1, 1).unwrap().has(LOADED));
    assert!(!loader.tile_state(0, 2, 2).unwrap().has(HAS_LL));

    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());
    let side = synthetic.tile_side_um(0);
    let viewport = slide.viewport(
        Bounds::new(2.25 * side, 2.25 * side, 2.75 * side, 2.75 * side),
        0,
    );

    let mut restores = 0;
    let mut settled = false;
    for _ in 0..MAX_PASSES {
        let report = streamer.service(&viewport);
        restores += report.low_pass_requests;
        if report.is_settled() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(settled, "viewport did not settle");
    assert!(restores > 0);

    check_delivered(&sink.take(), &synthetic);
    for y in 1..=3 {
        for x in 1..=3 {
            assert!(loader.tile_state(0, x, y).unwrap().has(LOADED), "tile ({}, {})", x, y);
        }
    }
    assert_eq!(loader.readiness_violations(), 0);
}

// =============================================================================
// Randomized Viewports
// =============================================================================

#[tokio::test]
async fn test_random_viewports_inline() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(Arc::new(InlineQueue), sink.clone());

    let mut rng = Rng(0x9E37_79B9);
    for _ in 0..60 {
        let viewport = random_viewport(&mut rng, &slide, &synthetic);
        for _ in 0..1 + rng.below(3) {
            streamer.service(&viewport);
            tokio::task::yield_now().await;
        }
    }
    let last = random_viewport(&mut rng, &slide, &synthetic);
    assert!(streamer.settle(&last, MAX_PASSES).await.is_some());

    check_delivered(&sink.take(), &synthetic);
    assert_eq!(slide.loader().readiness_violations(), 0);
}

// =============================================================================
// Worker Pool
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_viewport_settles_on_worker_pool() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = test_config();
    let (slide, _) = open_synthetic(&synthetic, &config).await;
    let pool = Arc::new(WorkerPool::current(config.workers, config.queue_capacity));
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(pool.clone(), sink.clone());

    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());
    drain(&pool).await;

    let keys = check_delivered(&sink.take(), &synthetic);
    assert_eq!(keys.len(), 170);
    assert_eq!(slide.loader().readiness_violations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_viewports_on_worker_pool() {
    let synthetic = SyntheticSlideBuilder::new().top_tiles(2, 2).build();
    let config = test_config();
    let (slide, _) = open_synthetic(&synthetic, &config).await;
    let pool = Arc::new(WorkerPool::current(config.workers, config.queue_capacity));
    let sink = Arc::new(CollectingSink::new());
    let streamer = slide.streamer(pool.clone(), sink.clone());

    let mut rng = Rng(0x0BAD_5EED);
    for _ in 0..200 {
        let viewport = random_viewport(&mut rng, &slide, &synthetic);
        streamer.service(&viewport);
        tokio::time::sleep(Duration::from_micros(u64::from(rng.below(500)))).await;
    }
    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());
    drain(&pool).await;

    let keys = check_delivered(&sink.take(), &synthetic);
    let expected: usize = (0..synthetic.levels)
        .map(|s| {
            let (x, y) = synthetic.tiles_at(s);
            x * y
        })
        .sum();
    assert_eq!(keys.len(), expected);
    assert_eq!(slide.loader().readiness_violations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streamer_and_decode_tile_share_state() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = test_config();
    let (slide, _) = open_synthetic(&synthetic, &config).await;
    let pool = Arc::new(WorkerPool::current(config.workers, config.queue_capacity));
    let sink = Arc::new(CollectingSink::new());
    let streamer: TileStreamer = slide.streamer(pool.clone(), sink.clone());

    let forced = {
        let slide = Arc::clone(&slide);
        tokio::spawn(async move { slide.decode_tile(0, 7, 3).await })
    };
    assert!(streamer.settle(&full_viewport(&slide, 0), MAX_PASSES).await.is_some());
    drain(&pool).await;

    let outcome = forced.await.unwrap().unwrap();
    if let Some(tile) = outcome.pixels() {
        assert_eq!(tile.bgra.as_ref(), synthetic.expected_bgra(0, 7, 3).as_slice());
    }
    // Tiles the force path produced are not handed to the sink
    let keys = check_delivered(&sink.take(), &synthetic);
    assert!(keys.len() <= 170);
    assert_eq!(slide.loader().readiness_violations(), 0);
}
