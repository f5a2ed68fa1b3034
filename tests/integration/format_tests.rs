//! Container and header tests over synthetic iSyntax files.
//!
//! These tests cover:
//! - Header metadata and pyramid geometry
//! - Full block header tables and seektable-resolved partial tables
//! - Chunk grouping against the layout the builder wrote
//! - Associated images
//! - Rejection of truncated and foreign files

use std::sync::Arc;

use isyntax_streamer::format::isyntax::container::EOT_MARKER;
use isyntax_streamer::format::isyntax::layout::levels_in_chunk;
use isyntax_streamer::{open_container, FormatError, ImageKind, IsyntaxSlide};

use super::test_utils::{open_synthetic, test_config, SyntheticSlideBuilder, TrackingMockReader};

// =============================================================================
// Header Metadata
// =============================================================================

#[tokio::test]
async fn test_import_metadata() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let import = slide.import();
    assert_eq!(import.manufacturer.as_deref(), Some("PHILIPS"));
    assert_eq!(import.model_name.as_deref(), Some("Synthetic Scanner"));
    assert_eq!(import.device_serial_number.as_deref(), Some("SYN-0001"));
    assert_eq!(import.barcode.as_deref(), Some("SLIDE-42"));

    let wsi = slide.wsi_image().expect("WSI image header");
    assert_eq!(wsi.kind, ImageKind::Wsi);
    assert_eq!(wsi.compressor_version(), 2);
}

#[tokio::test]
async fn test_header_length_and_data_offset() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let eot = synthetic
        .data
        .iter()
        .position(|&b| b == EOT_MARKER)
        .expect("EOT marker") as u64;
    assert_eq!(slide.header_length(), eot);
    assert_eq!(slide.data_offset(), eot + 1);
}

#[tokio::test]
async fn test_pyramid_geometry() {
    let synthetic = SyntheticSlideBuilder::new().levels(4).top_tiles(2, 1).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert_eq!(slide.level_count(), 4);
    assert_eq!(slide.dimensions(), (256, 128));
    assert_eq!(slide.tile_size(), (16, 16));

    let levels = slide.levels();
    let grids: Vec<(u32, u32)> = levels.iter().map(|l| (l.tiles_x, l.tiles_y)).collect();
    assert_eq!(grids, vec![(16, 8), (8, 4), (4, 2), (2, 1)]);
    for level in &levels {
        assert_eq!(level.existing_tiles, level.tiles_x * level.tiles_y);
        assert_eq!(level.downsample, f64::from(1u32 << level.scale));
        assert!((level.mpp_x - 0.25 * level.downsample).abs() < 1e-9);
    }
    assert_eq!(levels[1].width, 128);
    assert_eq!(levels[3].height, 16);

    let bounds = slide.bounds();
    assert_eq!((bounds.max_x, bounds.max_y), (64.0, 32.0));
}

#[tokio::test]
async fn test_level_info_out_of_range() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;
    assert!(slide.level_info(4).is_none());
}

// =============================================================================
// Codeblocks and Chunks
// =============================================================================

#[tokio::test]
async fn test_chunks_match_written_layout() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let reader = synthetic.reader();
    let container = open_container(&reader).await.unwrap();
    let store = &container.store;

    assert_eq!(store.codeblocks.len(), synthetic.codeblock_count);
    let ranges: Vec<(u64, u64)> = store.chunks.iter().map(|c| (c.offset, c.size)).collect();
    assert_eq!(ranges, synthetic.chunk_ranges);

    // Two top chunks hold one scale each, the eight below hold three
    let top: Vec<_> = store.chunks.iter().filter(|c| c.top_scale == 3).collect();
    assert_eq!(top.len(), 2);
    assert!(top.iter().all(|c| c.levels == levels_in_chunk(3)));
    assert_eq!(store.chunks.iter().filter(|c| c.top_scale == 2).count(), 8);
}

#[tokio::test]
async fn test_every_tile_points_into_its_chunk() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let reader = synthetic.reader();
    let store = open_container(&reader).await.unwrap().store;

    for scale in 0..store.level_count() as u32 {
        let level = store.level(scale).unwrap();
        for (x, y) in level.bounds().iter() {
            let tile = level.tile(x, y).unwrap();
            assert!(tile.exists);
            let chunk = store.chunk(tile.chunk).unwrap();
            for &index in &tile.h_codeblocks {
                let codeblock = store.codeblock(index).unwrap();
                assert!(chunk.covers(codeblock), "scale {} tile ({}, {})", scale, x, y);
                assert_eq!(codeblock.scale, scale);
            }
            assert_eq!(tile.ll_codeblocks.is_some(), scale == 3);
        }
    }
}

#[tokio::test]
async fn test_partial_table_resolved_from_seektable() {
    let full = SyntheticSlideBuilder::new().build();
    let partial = SyntheticSlideBuilder::new().partial(true).build();

    let full_store = open_container(&full.reader()).await.unwrap().store;
    let partial_store = open_container(&partial.reader()).await.unwrap().store;

    assert_eq!(partial_store.codeblocks.len(), full_store.codeblocks.len());
    let ranges: Vec<(u64, u64)> = partial_store.chunks.iter().map(|c| (c.offset, c.size)).collect();
    assert_eq!(ranges, partial.chunk_ranges);

    // Same payloads, shifted by the seektable
    let shift = partial_store.codeblocks[0].offset - full_store.codeblocks[0].offset;
    assert!(shift > 0);
    for (a, b) in full_store.codeblocks.iter().zip(&partial_store.codeblocks) {
        assert_eq!((a.x, a.y, a.color, a.scale, a.coefficient), (b.x, b.y, b.color, b.scale, b.coefficient));
        assert_eq!(a.size, b.size);
        assert_eq!(a.offset + shift, b.offset);
    }
}

#[tokio::test]
async fn test_partial_table_decodes_same_pixels() {
    let synthetic = SyntheticSlideBuilder::new().partial(true).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let tile = slide.decode_tile(0, 5, 3).await.unwrap();
    let tile = tile.pixels().expect("tile pixels");
    assert_eq!(tile.bgra.as_ref(), synthetic.expected_bgra(0, 5, 3).as_slice());
}

#[tokio::test]
async fn test_compressor_version_one() {
    let synthetic = SyntheticSlideBuilder::new().compressor_version(1).build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert!(slide.loader().store().codeblocks.iter().all(|cb| cb.compressor_version == 1));
    let tile = slide.decode_tile(1, 2, 1).await.unwrap();
    let tile = tile.pixels().expect("tile pixels");
    assert_eq!(tile.bgra.as_ref(), synthetic.expected_bgra(1, 2, 1).as_slice());
}

// =============================================================================
// Associated Images
// =============================================================================

#[tokio::test]
async fn test_label_image() {
    let synthetic = SyntheticSlideBuilder::new().with_label().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    let jpeg = synthetic.label_jpeg.as_deref().unwrap();
    assert_eq!(slide.associated_image(ImageKind::Label), Some(jpeg));

    let png = slide.associated_png(ImageKind::Label).unwrap().expect("label PNG");
    assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    let decoded = image::load_from_memory(&png).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (48, 24));
}

#[tokio::test]
async fn test_missing_macro_image() {
    let synthetic = SyntheticSlideBuilder::new().with_label().build();
    let (slide, _) = open_synthetic(&synthetic, &test_config()).await;

    assert!(slide.associated_image(ImageKind::Macro).is_none());
    assert!(slide.associated_png(ImageKind::Macro).unwrap().is_none());
}

// =============================================================================
// Rejected Files
// =============================================================================

#[tokio::test]
async fn test_truncated_data_is_rejected() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let mut data = synthetic.data.clone();
    data.truncate(data.len() - 10);
    let reader = TrackingMockReader::new(data, "mock://truncated.isyntax");

    let result = IsyntaxSlide::open(Arc::new(reader), &test_config()).await;
    assert!(matches!(result, Err(FormatError::InvalidGeometry(_))));
}

#[tokio::test]
async fn test_tiff_is_rejected() {
    let reader = TrackingMockReader::new(b"II*\x00\x08\x00\x00\x00".to_vec(), "mock://slide.tif");
    let result = IsyntaxSlide::open(Arc::new(reader), &test_config()).await;
    assert!(matches!(result, Err(FormatError::UnsupportedFormat { .. })));
}

#[tokio::test]
async fn test_header_without_eot_is_rejected() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let eot = synthetic.data.iter().position(|&b| b == EOT_MARKER).unwrap();
    let reader = TrackingMockReader::new(synthetic.data[..eot].to_vec(), "mock://no-eot.isyntax");
    assert!(matches!(
        open_container(&reader).await,
        Err(FormatError::MissingEotMarker)
    ));
}

#[tokio::test]
async fn test_open_reads_only_header_and_top_chunks() {
    let synthetic = SyntheticSlideBuilder::new().build();
    let (_slide, reader) = open_synthetic(&synthetic, &test_config()).await;

    let requests = reader.get_requests().await;
    let chunk_reads: Vec<u64> = requests
        .iter()
        .map(|&(offset, _)| offset)
        .filter(|offset| synthetic.chunk_ranges.iter().any(|(o, _)| o == offset))
        .collect();
    let top_offsets: Vec<u64> = synthetic.chunk_ranges[..2].iter().map(|&(o, _)| o).collect();
    assert_eq!(chunk_reads.len(), 2);
    assert!(chunk_reads.iter().all(|o| top_offsets.contains(o)));
}
