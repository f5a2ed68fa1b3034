//! End-to-end decoding tests.
//!
//! Every tile of a synthetic slide has an exactly known value, so these tests
//! compare reconstructed pixels byte for byte:
//! - Top levels decoded at open time
//! - On-demand decoding at every scale
//! - Rebuilding tiles evicted from the tile cache
//! - Decoding under small coefficient pools
//! - Corrupt codeblocks and failing reads
//! - Argument validation

use isyntax_streamer::tile::{FAILED, HAS_H, LOADED};
use isyntax_streamer::{IsyntaxSlide, StreamerConfig, TileCacheKey, TileError, TileOutcome};
use std::sync::Arc;

use super::test_utils::{open_synthetic, test_config, SyntheticSlide, SyntheticSlideBuilder};

async fn assert_tile_matches(slide: &IsyntaxSlide, synthetic: &SyntheticSlide, scale: u32, x: usize, y: usize) {
    let outcome = slide.decode_tile(scale, x as u32, y as u32).await.unwrap();
    let tile = outcome
        .pixels()
        .unwrap_or_else(|| panic!("tile ({}, {}) of level {} not decoded: {:?}", x, y, scale, outcome));
    assert_eq!((tile.width, tile.height), (16, 16));
    assert_eq!((tile.level, tile.tile_x, tile.tile_y), (scale, x as u32, y as u32));
    assert!(
        tile.bgra.as_ref() == synthetic.expected_bgra(scale, x, y).as_slice(),
        "tile ({}, {}) of level {} differs",
        x,
        y,
        scale
    );
}

// =============================================================================
// First Load
// =============================================================================

#[tokio::test]
async fn test_top_level_is_loaded_at_open() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let loader = slide.loader();

    assert!(loader.level_state(3).unwrap().is_complete());
    assert!(!loader.level_state(2).unwrap().is_complete());
    for x in 0..2 {
        assert!(loader.tile_state(3, x, 0).unwrap().has(LOADED));
    }
    assert_eq!(loader.tile_cache().len(), 2);
}

#[tokio::test]
async fn test_top_level_pixels() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, reader) = open_synthetic(&synthetic, &test_config()).await;

    reader.reset_tracking();
    assert_tile_matches(&slide, &synthetic, 3, 0, 0).await;
    assert_tile_matches(&slide, &synthetic, 3, 1, 0).await;
    // Served from the tile cache
    assert_eq!(reader.request_count(), 0);
}

#[tokio::test]
async fn test_three_level_file_loads_completely_at_open() {
    let synthetic = SyntheticSlideBuilder::new().levels(3).top_tiles(1, 1).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    let loader = slide.loader();

    // A single chunk rooted at scale 2 spans the whole pyramid
    assert_eq!(loader.store().chunks.len(), 1);
    for scale in 0..3 {
        assert!(loader.level_state(scale).unwrap().is_complete(), "level {}", scale);
    }
    assert_tile_matches(&slide, &synthetic, 0, 3, 3).await;
    assert_tile_matches(&slide, &synthetic, 1, 0, 1).await;
}

// =============================================================================
// On-Demand Decoding
// =============================================================================

#[tokio::test]
async fn test_decode_finest_tiles() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    for (x, y) in [(0, 0), (15, 0), (0, 7), (15, 7), (6, 3), (9, 4)] {
        assert_tile_matches(&slide, &synthetic, 0, x, y).await;
    }
    assert_eq!(slide.loader().readiness_violations(), 0);
}

#[tokio::test]
async fn test_decode_every_tile_of_a_level() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let (tiles_x, tiles_y) = synthetic.tiles_at(1);
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            assert_tile_matches(&slide, &synthetic, 1, x, y).await;
        }
    }
    assert!(slide.loader().level_state(1).unwrap().is_complete());
}

#[tokio::test]
async fn test_decode_loads_only_the_dependency_cone() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, reader) = open_synthetic(&synthetic, &test_config()).await;
    reader.reset_tracking();

    assert_tile_matches(&slide, &synthetic, 0, 0, 0).await;

    // Tile (0, 0) and its neighbors live in the chunk of scale-2 tile (0, 0),
    // whose own neighborhood reaches into the chunks to its right and below
    let loader = slide.loader();
    assert!(!loader.tile_state(0, 15, 7).unwrap().has(HAS_H));
    assert!(!loader.tile_state(0, 15, 7).unwrap().is_done());
    assert!(reader.request_count() <= 4);
    assert_eq!(reader.reads_at(synthetic.chunk_ranges[9].0).await, 0);
}

#[tokio::test]
async fn test_repeated_decode_hits_cache() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, reader) = open_synthetic(&synthetic, &test_config()).await;

    assert_tile_matches(&slide, &synthetic, 0, 4, 4).await;
    reader.reset_tracking();
    assert_tile_matches(&slide, &synthetic, 0, 4, 4).await;
    assert_eq!(reader.request_count(), 0);
}

#[tokio::test]
async fn test_concurrent_decodes_agree() {
    let synthetic = Arc::new(SyntheticSlideBuilder::new().build());
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let mut handles = Vec::new();
    for (x, y) in [(2u32, 2u32), (3, 2), (2, 3), (3, 3), (2, 2)] {
        let slide = Arc::clone(&slide);
        handles.push(tokio::spawn(async move { (x, y, slide.decode_tile(0, x, y).await) }));
    }
    for handle in handles {
        let (x, y, outcome) = handle.await.unwrap();
        match outcome.unwrap() {
            TileOutcome::Pixels(tile) => {
                assert_eq!(tile.bgra.as_ref(), synthetic.expected_bgra(0, x as usize, y as usize).as_slice());
            }
            // A duplicate request may find the tile mid-load
            TileOutcome::Pending => {}
            TileOutcome::Unavailable => panic!("tile ({}, {}) unavailable", x, y),
        }
    }
    assert_eq!(slide.loader().readiness_violations(), 0);
}

#[tokio::test]
async fn test_coefficients_released_after_neighbors_load() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let (tiles_x, tiles_y) = synthetic.tiles_at(2);
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            slide.decode_tile(2, x as u32, y as u32).await.unwrap();
        }
    }

    // Every scale-2 tile and all its neighbors are loaded: no H data remains
    let loader = slide.loader();
    let level = loader.level_state(2).unwrap();
    assert!(level.is_complete());
    assert!(level.tiles.iter().all(|t| !t.has(HAS_H)));
}

// =============================================================================
// Memory Pressure
// =============================================================================

/// Room for two 16x16 BGRA tiles.
const TWO_TILES: usize = 2 * 16 * 16 * 4;

#[tokio::test]
async fn test_evicted_tile_is_rebuilt() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = StreamerConfig {
        tile_cache_bytes: TWO_TILES,
        ..test_config()
    };
    let (slide, _) = open_synthetic(&synthetic, &config).await;
    let loader = slide.loader();

    assert_tile_matches(&slide, &synthetic, 0, 0, 0).await;
    for x in 1..=8 {
        assert_tile_matches(&slide, &synthetic, 0, x, 0).await;
    }
    assert!(!loader.tile_cache().contains(&TileCacheKey::new(0, 0, 0)));
    assert!(loader.tile_state(0, 0, 0).unwrap().has(LOADED));

    let done = loader.level_state(0).unwrap().done_count();
    assert_tile_matches(&slide, &synthetic, 0, 0, 0).await;
    // A rebuild is not a second completion
    assert_eq!(loader.level_state(0).unwrap().done_count(), done);
    assert_eq!(loader.readiness_violations(), 0);
}

#[tokio::test]
async fn test_evicted_tile_with_released_neighborhood_is_rebuilt() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = StreamerConfig {
        tile_cache_bytes: TWO_TILES,
        ..test_config()
    };
    let (slide, reader) = open_synthetic(&synthetic, &config).await;

    let (tiles_x, tiles_y) = synthetic.tiles_at(1);
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            assert_tile_matches(&slide, &synthetic, 1, x, y).await;
        }
    }
    let loader = slide.loader();
    assert!(loader.level_state(1).unwrap().is_complete());
    assert!(!loader.coefficients_needed(1, 3, 2));

    // Coefficients come back from the cached chunks and the loaded ancestors
    reader.reset_tracking();
    assert_tile_matches(&slide, &synthetic, 1, 3, 2).await;
    assert_tile_matches(&slide, &synthetic, 2, 1, 1).await;
    assert_tile_matches(&slide, &synthetic, 3, 0, 0).await;
    assert_eq!(reader.request_count(), 0);
    assert_eq!(loader.readiness_violations(), 0);
}

#[tokio::test]
async fn test_small_pools_decode_a_spread_of_tiles() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let config = StreamerConfig {
        ll_pool_blocks: 96,
        h_pool_blocks: 96,
        pool_chunk_blocks: 16,
        ..test_config()
    };
    let (slide, _) = open_synthetic(&synthetic, &config).await;

    let (tiles_x, tiles_y) = synthetic.tiles_at(0);
    for y in (0..tiles_y).step_by(3) {
        for x in (0..tiles_x).step_by(3) {
            assert_tile_matches(&slide, &synthetic, 0, x, y).await;
        }
    }

    let loader = slide.loader();
    // Idle coefficients made room; nothing was failed for lack of memory
    assert!(loader.reclaimed() > 0);
    for scale in 0..4 {
        let level = loader.level_state(scale).unwrap();
        assert!(level.tiles.iter().all(|t| !t.has(FAILED)), "level {}", scale);
    }
    assert!(loader.pools().ll.in_use() <= 96);
    assert!(loader.pools().h.chunk_count() <= 6);
    assert_eq!(loader.readiness_violations(), 0);
}

#[tokio::test]
async fn test_pool_smaller_than_a_neighborhood_stays_retryable() {
    let synthetic = SyntheticSlideBuilder::new().build();
    // Three tiles' worth of high-pass blocks cannot hold one 3x3 neighborhood
    let config = StreamerConfig {
        h_pool_blocks: 9,
        ..test_config()
    };
    let (slide, _) = open_synthetic(&synthetic, &config).await;

    assert_eq!(slide.decode_tile(0, 6, 3).await.unwrap(), TileOutcome::Pending);
    let loader = slide.loader();
    assert!(!loader.tile_state(0, 6, 3).unwrap().has(FAILED));
    assert!(!loader.tile_state(1, 3, 1).unwrap().has(FAILED));
    assert!(loader.reclaimed() > 0);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_corrupt_codeblock_fails_tile_and_descendants() {
    let synthetic = SyntheticSlideBuilder::new().corrupt_tile(1, 0, 0).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let outcome = slide.decode_tile(0, 0, 0).await.unwrap();
    assert_eq!(outcome, TileOutcome::Unavailable);

    let loader = slide.loader();
    assert!(loader.tile_state(1, 0, 0).unwrap().has(FAILED));
    for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        assert!(loader.tile_state(0, x, y).unwrap().has(FAILED), "child ({}, {})", x, y);
    }

    // A failed tile stays unavailable
    assert_eq!(slide.decode_tile(1, 0, 0).await.unwrap(), TileOutcome::Unavailable);
    assert_eq!(slide.decode_tile(0, 1, 1).await.unwrap(), TileOutcome::Unavailable);
}

#[tokio::test]
async fn test_tiles_away_from_a_failure_are_exact() {
    let synthetic = SyntheticSlideBuilder::new().corrupt_tile(1, 0, 0).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert_eq!(slide.decode_tile(0, 0, 0).await.unwrap(), TileOutcome::Unavailable);
    assert_tile_matches(&slide, &synthetic, 0, 15, 7).await;
    assert_tile_matches(&slide, &synthetic, 1, 6, 3).await;

    // A neighbor of the failed tile still decodes
    let outcome = slide.decode_tile(1, 1, 0).await.unwrap();
    assert!(outcome.pixels().is_some());
}

#[tokio::test]
async fn test_failing_chunk_read() {
    let synthetic = SyntheticSlideBuilder::new().build();
    // Chunk 2 is the first one rooted at scale 2, tile (0, 0)
    let (offset, size) = synthetic.chunk_ranges[2];
    let reader = synthetic.reader().with_failing_range(offset, size);
    let slide = IsyntaxSlide::open(Arc::new(reader), &test_config()).await.unwrap();

    assert_eq!(slide.decode_tile(2, 0, 0).await.unwrap(), TileOutcome::Unavailable);
    assert_eq!(slide.decode_tile(0, 1, 2).await.unwrap(), TileOutcome::Unavailable);
    assert!(slide.loader().tile_state(2, 0, 0).unwrap().has(FAILED));

    assert_tile_matches(&slide, &synthetic, 0, 15, 7).await;
}

// =============================================================================
// Argument Validation
// =============================================================================

#[tokio::test]
async fn test_invalid_level() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert!(matches!(
        slide.decode_tile(4, 0, 0).await,
        Err(TileError::InvalidLevel { level: 4, max_levels: 4 })
    ));
}

#[tokio::test]
async fn test_tile_out_of_bounds() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert!(matches!(
        slide.decode_tile(0, 16, 0).await,
        Err(TileError::TileOutOfBounds { level: 0, x: 16, y: 0, max_x: 16, max_y: 8 })
    ));
    assert!(matches!(
        slide.decode_tile(3, 0, 1).await,
        Err(TileError::TileOutOfBounds { .. })
    ));
}
