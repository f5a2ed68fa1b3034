//! Configuration management for the iSyntax streamer.
//!
//! This module provides:
//! - Command-line arguments and subcommands via clap
//! - Environment variables with `ISYNTAX_` prefix for runtime tunables
//! - Sensible defaults for all optional settings
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use isyntax_streamer::config::Cli;
//!
//! let cli = Cli::parse();
//! ```
//!
//! # Environment Variables
//!
//! - `ISYNTAX_WORKERS` - Decode worker threads (default: available parallelism)
//! - `ISYNTAX_QUEUE_CAPACITY` - Maximum queued tasks (default: 1024)
//! - `ISYNTAX_CHUNK_CACHE_CHUNKS` - Resident data chunks (default: 256)
//! - `ISYNTAX_TILE_CACHE_BYTES` - Decoded tile cache size (default: 256MB)
//! - `ISYNTAX_MAX_CHUNKS_PER_PASS` - Chunks considered per scheduling pass (default: 16)
//! - `ISYNTAX_DECOMPRESS_BACKLOG_FACTOR` - Decompression backlog per worker (default: 10)
//! - `ISYNTAX_LOAD_BACKLOG_FACTOR` - Load backlog per worker (default: 4)
//! - `ISYNTAX_LL_POOL_BLOCKS` - Low-pass pool capacity in blocks (default: 16384)
//! - `ISYNTAX_H_POOL_BLOCKS` - High-pass pool capacity in blocks (default: 8192)
//! - `ISYNTAX_POOL_CHUNK_BLOCKS` - Pool growth step in blocks (default: 64)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::io::DEFAULT_CHUNK_CACHE_CAPACITY;
use crate::tile::{DEFAULT_POOL_CHUNK_BLOCKS, DEFAULT_TILE_CACHE_CAPACITY};

// =============================================================================
// Default Values
// =============================================================================

/// Default maximum number of queued tasks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of chunks considered per scheduling pass.
pub const DEFAULT_MAX_CHUNKS_PER_PASS: usize = 16;

/// Default decompression backlog per worker before work runs inline.
pub const DEFAULT_DECOMPRESS_BACKLOG_FACTOR: usize = 10;

/// Default load backlog per worker before a pass stops submitting.
pub const DEFAULT_LOAD_BACKLOG_FACTOR: usize = 4;

/// Default low-pass pool capacity in blocks.
pub const DEFAULT_LL_POOL_BLOCKS: usize = 16384;

/// Default high-pass pool capacity in blocks.
pub const DEFAULT_H_POOL_BLOCKS: usize = 8192;

/// Number of worker threads to use when not configured.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Streamer Configuration
// =============================================================================

/// Runtime tunables shared by every subcommand.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    /// Number of decode worker threads.
    #[arg(long, default_value_t = default_workers(), env = "ISYNTAX_WORKERS")]
    pub workers: usize,

    /// Maximum number of queued decode tasks.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, env = "ISYNTAX_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Number of data chunks kept resident.
    #[arg(long, default_value_t = DEFAULT_CHUNK_CACHE_CAPACITY, env = "ISYNTAX_CHUNK_CACHE_CHUNKS")]
    pub chunk_cache_chunks: usize,

    /// Decoded tile cache size in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "ISYNTAX_TILE_CACHE_BYTES")]
    pub tile_cache_bytes: usize,

    /// Maximum distinct chunks handled in one scheduling pass.
    #[arg(long, default_value_t = DEFAULT_MAX_CHUNKS_PER_PASS, env = "ISYNTAX_MAX_CHUNKS_PER_PASS")]
    pub max_chunks_per_pass: usize,

    /// Queued decompressions per worker above which decompression runs inline.
    #[arg(
        long,
        default_value_t = DEFAULT_DECOMPRESS_BACKLOG_FACTOR,
        env = "ISYNTAX_DECOMPRESS_BACKLOG_FACTOR"
    )]
    pub decompress_backlog_factor: usize,

    /// Queued tasks per worker above which a pass stops submitting loads.
    #[arg(long, default_value_t = DEFAULT_LOAD_BACKLOG_FACTOR, env = "ISYNTAX_LOAD_BACKLOG_FACTOR")]
    pub load_backlog_factor: usize,

    /// Low-pass coefficient pool capacity in blocks.
    #[arg(long, default_value_t = DEFAULT_LL_POOL_BLOCKS, env = "ISYNTAX_LL_POOL_BLOCKS")]
    pub ll_pool_blocks: usize,

    /// High-pass coefficient pool capacity in blocks.
    #[arg(long, default_value_t = DEFAULT_H_POOL_BLOCKS, env = "ISYNTAX_H_POOL_BLOCKS")]
    pub h_pool_blocks: usize,

    /// Blocks added to a pool per growth step.
    #[arg(long, default_value_t = DEFAULT_POOL_CHUNK_BLOCKS, env = "ISYNTAX_POOL_CHUNK_BLOCKS")]
    pub pool_chunk_blocks: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_cache_chunks: DEFAULT_CHUNK_CACHE_CAPACITY,
            tile_cache_bytes: DEFAULT_TILE_CACHE_CAPACITY,
            max_chunks_per_pass: DEFAULT_MAX_CHUNKS_PER_PASS,
            decompress_backlog_factor: DEFAULT_DECOMPRESS_BACKLOG_FACTOR,
            load_backlog_factor: DEFAULT_LOAD_BACKLOG_FACTOR,
            ll_pool_blocks: DEFAULT_LL_POOL_BLOCKS,
            h_pool_blocks: DEFAULT_H_POOL_BLOCKS,
            pool_chunk_blocks: DEFAULT_POOL_CHUNK_BLOCKS,
        }
    }
}

impl StreamerConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("chunk_cache_chunks", self.chunk_cache_chunks),
            ("tile_cache_bytes", self.tile_cache_bytes),
            ("max_chunks_per_pass", self.max_chunks_per_pass),
            ("decompress_backlog_factor", self.decompress_backlog_factor),
            ("load_backlog_factor", self.load_backlog_factor),
            ("ll_pool_blocks", self.ll_pool_blocks),
            ("h_pool_blocks", self.h_pool_blocks),
            ("pool_chunk_blocks", self.pool_chunk_blocks),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(format!("{} must be greater than 0", name));
            }
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// iSyntax Streamer - decode and stream Philips iSyntax whole slide images.
#[derive(Parser, Debug, Clone)]
#[command(name = "isyntax-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print header metadata and pyramid geometry.
    Info(InfoConfig),

    /// Decode one tile and write it as PNG.
    Tile(TileConfig),

    /// Drive the streamer with a panning viewport.
    Stream(StreamConfig),

    /// Export the label or macro image.
    Associated(AssociatedConfig),
}

#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Path to the iSyntax file.
    pub file: PathBuf,

    /// Print metadata as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    #[command(flatten)]
    pub streamer: StreamerConfig,
}

#[derive(Args, Debug, Clone)]
pub struct TileConfig {
    /// Path to the iSyntax file.
    pub file: PathBuf,

    /// Pyramid level (0 = full resolution).
    #[arg(long)]
    pub level: u32,

    /// Tile column.
    #[arg(long)]
    pub x: u32,

    /// Tile row.
    #[arg(long)]
    pub y: u32,

    /// Output PNG path.
    #[arg(short, long, default_value = "tile.png")]
    pub output: PathBuf,

    #[command(flatten)]
    pub streamer: StreamerConfig,
}

#[derive(Args, Debug, Clone)]
pub struct StreamConfig {
    /// Path to the iSyntax file.
    pub file: PathBuf,

    /// Level the viewport is zoomed to (defaults to the coarsest level).
    #[arg(long)]
    pub zoom: Option<u32>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 120)]
    pub frames: u32,

    /// Viewport width and height in tiles of the zoom level.
    #[arg(long, default_value_t = 4)]
    pub view_tiles: u32,

    /// Tiles panned over the whole run.
    #[arg(long, default_value_t = 0)]
    pub pan_tiles: u32,

    #[command(flatten)]
    pub streamer: StreamerConfig,
}

/// Associated image kinds.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociatedKind {
    Label,
    Macro,
}

#[derive(Args, Debug, Clone)]
pub struct AssociatedConfig {
    /// Path to the iSyntax file.
    pub file: PathBuf,

    /// Which image to export.
    #[arg(long, value_enum)]
    pub kind: AssociatedKind,

    /// Output PNG path.
    #[arg(short, long, default_value = "associated.png")]
    pub output: PathBuf,

    #[command(flatten)]
    pub streamer: StreamerConfig,
}

impl Command {
    /// Runtime tunables of the selected subcommand.
    pub fn streamer_config(&self) -> &StreamerConfig {
        match self {
            Command::Info(c) => &c.streamer,
            Command::Tile(c) => &c.streamer,
            Command::Stream(c) => &c.streamer,
            Command::Associated(c) => &c.streamer,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
