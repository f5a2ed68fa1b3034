//! iSyntax Streamer - decode and stream iSyntax whole slide images.
//!
//! This binary exposes the library through a few inspection and export
//! subcommands.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use isyntax_streamer::{
    config::{AssociatedConfig, AssociatedKind, Cli, Command, InfoConfig, StreamConfig, TileConfig},
    format::isyntax::Bounds,
    tile::{ChannelSink, PngTileEncoder, TileOutcome, WorkerPool},
    ImageKind, IsyntaxSlide, StreamerConfig,
};

/// Frame pacing of the `stream` subcommand.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Passes allowed for the final viewport to settle.
const SETTLE_PASSES: usize = 10_000;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = cli.command.streamer_config().validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Info(config) => run_info(config).await,
        Command::Tile(config) => run_tile(config).await,
        Command::Stream(config) => run_stream(config).await,
        Command::Associated(config) => run_associated(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "isyntax_streamer=debug"
    } else {
        "isyntax_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open(file: &std::path::Path, config: &StreamerConfig) -> Option<Arc<IsyntaxSlide>> {
    match IsyntaxSlide::open_path(file, config).await {
        Ok(slide) => Some(slide),
        Err(e) => {
            error!("Failed to open {}: {}", file.display(), e);
            None
        }
    }
}

// =============================================================================
// Info Command
// =============================================================================

async fn run_info(config: InfoConfig) -> ExitCode {
    let Some(slide) = open(&config.file, &config.streamer).await else {
        return ExitCode::FAILURE;
    };
    let store = slide.loader().store();

    if config.json {
        let json = serde_json::json!({
            "file": slide.identifier(),
            "header_length": slide.header_length(),
            "data_offset": slide.data_offset(),
            "import": slide.import(),
            "images": slide.header().images,
            "dimensions": slide.dimensions(),
            "tile_size": slide.tile_size(),
            "levels": slide.levels(),
            "codeblocks": store.codeblocks.len(),
            "chunks": store.chunks.len(),
        });
        return match serde_json::to_string_pretty(&json) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cannot serialize metadata: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let import = slide.import();
    let show = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            println!("  {:<22} {}", name, value);
        }
    };
    println!("{}", slide.identifier());
    println!("═════════════════════════════════");
    show("Manufacturer:", &import.manufacturer);
    show("Model:", &import.model_name);
    show("Serial number:", &import.device_serial_number);
    show("Software versions:", &import.software_versions);
    show("Acquired:", &import.acquisition_datetime);
    show("Barcode:", &import.barcode);
    println!();

    println!("Images:");
    for image in &slide.header().images {
        let extra = match &image.image_data {
            Some(data) => format!(", {} bytes embedded JPEG", data.len()),
            None => String::new(),
        };
        println!("  {:?}{}", image.kind, extra);
    }
    println!();

    let (width, height) = slide.dimensions();
    let (tile_width, tile_height) = slide.tile_size();
    println!("Dimensions: {}x{} px, tiles {}x{} px", width, height, tile_width, tile_height);
    println!(
        "Codeblocks: {} in {} chunks, data starts at {}",
        store.codeblocks.len(),
        store.chunks.len(),
        slide.data_offset()
    );
    println!();
    println!("Levels:");
    for level in slide.levels() {
        println!(
            "  {:>2}  {:>7}x{:<7} {:>4}x{:<4} tiles ({} stored)  {:.4} µm/px",
            level.scale,
            level.width,
            level.height,
            level.tiles_x,
            level.tiles_y,
            level.existing_tiles,
            level.mpp_x
        );
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Tile Command
// =============================================================================

async fn run_tile(config: TileConfig) -> ExitCode {
    let Some(slide) = open(&config.file, &config.streamer).await else {
        return ExitCode::FAILURE;
    };

    let start = Instant::now();
    let tile = match slide.decode_tile(config.level, config.x, config.y).await {
        Ok(TileOutcome::Pixels(tile)) => tile,
        Ok(TileOutcome::Pending) => {
            error!("Tile is being decoded by another task, try again");
            return ExitCode::FAILURE;
        }
        Ok(TileOutcome::Unavailable) => {
            error!(
                "Tile ({}, {}) of level {} is not available",
                config.x, config.y, config.level
            );
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Decoded tile in {:.1?}", start.elapsed());

    let png = match PngTileEncoder::new().encode_bgra(&tile.bgra, tile.width, tile.height) {
        Ok(png) => png,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    write_output(&config.output, &png).await
}

async fn write_output(path: &std::path::Path, data: &[u8]) -> ExitCode {
    match tokio::fs::write(path, data).await {
        Ok(()) => {
            info!("Wrote {} ({} bytes)", path.display(), data.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Cannot write {}: {}", path.display(), e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Stream Command
// =============================================================================

async fn run_stream(config: StreamConfig) -> ExitCode {
    let Some(slide) = open(&config.file, &config.streamer).await else {
        return ExitCode::FAILURE;
    };
    let max_scale = (slide.level_count() - 1) as u32;
    let zoom = config.zoom.unwrap_or(max_scale).min(max_scale);
    let Some(level) = slide.levels().into_iter().nth(zoom as usize) else {
        return ExitCode::FAILURE;
    };

    let tile_um_x = f64::from(level.tile_width) * level.mpp_x;
    let tile_um_y = f64::from(level.tile_height) * level.mpp_y;
    let view_w = f64::from(config.view_tiles) * tile_um_x;
    let view_h = f64::from(config.view_tiles) * tile_um_y;
    let pan = f64::from(config.pan_tiles) * tile_um_x;
    let frames = config.frames.max(1);
    let viewport_at = |frame: u32| {
        let dx = pan * f64::from(frame) / f64::from(frames);
        slide.viewport(Bounds::new(dx, 0.0, dx + view_w, view_h), zoom)
    };

    let queue = Arc::new(WorkerPool::current(config.streamer.workers, config.streamer.queue_capacity));
    let (sink, mut delivered) = ChannelSink::new();
    let streamer = slide.streamer(queue, Arc::new(sink));

    let start = Instant::now();
    let mut tiles = 0usize;
    let mut passes = 0usize;
    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    for frame in 0..frames {
        interval.tick().await;
        let report = streamer.service(&viewport_at(frame));
        passes += 1;
        while delivered.try_recv().is_ok() {
            tiles += 1;
        }
        if report.interrupted {
            warn!("Frame {} interrupted by a newer viewport", frame);
        }
    }

    let settled = streamer.settle(&viewport_at(frames), SETTLE_PASSES).await;
    while delivered.try_recv().is_ok() {
        tiles += 1;
    }

    println!("Streamed level {} over {} frames in {:.1?}", zoom, frames, start.elapsed());
    println!("  tiles delivered:  {}", tiles);
    println!("  frame passes:     {}", passes);
    match settled {
        Some(extra) => println!("  fixed point:      reached after {} more passes", extra),
        None => println!("  fixed point:      not reached"),
    }
    println!("  resident chunks:  {}", slide.loader().chunk_cache().len().await);
    println!(
        "  readiness checks: {} violations",
        slide.loader().readiness_violations()
    );

    if settled.is_some() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// =============================================================================
// Associated Command
// =============================================================================

async fn run_associated(config: AssociatedConfig) -> ExitCode {
    let Some(slide) = open(&config.file, &config.streamer).await else {
        return ExitCode::FAILURE;
    };
    let kind = match config.kind {
        AssociatedKind::Label => ImageKind::Label,
        AssociatedKind::Macro => ImageKind::Macro,
    };

    match slide.associated_png(kind) {
        Ok(Some(png)) => write_output(&config.output, &png).await,
        Ok(None) => {
            error!("{} has no {:?} image", slide.identifier(), kind);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
