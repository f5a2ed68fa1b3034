//! Tile loading: decompression, reconstruction and donation.
//!
//! A tile at scale `s` becomes pixels in two steps:
//!
//! ```text
//!  chunk bytes ──decompress──► H blocks (+ LL blocks at the top scale)
//!
//!  LL + H of the tile and its 8 neighbors ──inverse 5/3──► 2bw × 2bh samples
//!                                                           │         │
//!                                          YCoCg ► BGRA ◄───┘         │
//!                                     children's LL blocks ◄──────────┘
//! ```
//!
//! The loader owns all runtime tile state of one slide. Scheduling decisions
//! are made elsewhere (the streamer and the `decode_tile` force path); every
//! entry point here assumes the caller already holds the matching claim.
//!
//! Coefficient blocks are treated as a cache. When a pool runs dry the loader
//! drops idle coefficient sets, least recently used first, and a tile whose
//! blocks still cannot be allocated is left unclaimed for a later retry
//! instead of being failed. Loads pin the 3×3 neighborhood they read so that
//! reclaiming never pulls blocks from under a reconstruction.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::allocator::{CoefficientPools, PooledBlock};
use super::cache::{TileCache, TileCacheKey};
use super::queue::{CompletedTile, TileSink};
use super::state::{
    LevelState, TileState, FAILED, HAS_H, HAS_LL, H_CLAIMED, LOADED, LOAD_CLAIMED,
};
use crate::codec::{
    decode_codeblock, extract_quadrant, reconstruct, ycocg_to_bgra, Neighborhood, TileCoefficients,
};
use crate::config::StreamerConfig;
use crate::error::{DecodeError, IoError};
use crate::format::isyntax::layout::{adjacency_bit, levels_in_chunk, CodeblockStore, COLOR_COUNT};
use crate::io::{ChunkCache, RangeReader};

/// Outcome of [`TileLoader::claim_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadClaim {
    /// The caller owns the load and its neighborhood is pinned
    Claimed,
    /// Another task holds the claim, or the tile is done or failed
    Busy,
    /// Some tile of the neighborhood lacks coefficients
    NotReady,
}

/// Children that receive low-pass data from a reconstructed tile.
#[derive(Debug, Clone, Default)]
pub enum Donation {
    /// Every child that still needs coefficients
    #[default]
    Needed,
    /// Only the listed `(x, y)` children
    Only(BTreeSet<(i32, i32)>),
}

#[derive(Debug, Clone, Copy)]
enum PoolKind {
    LowPass,
    HighPass,
}

/// Shared runtime state of one opened slide.
pub struct TileLoader {
    store: CodeblockStore,
    levels: Vec<LevelState>,
    pools: CoefficientPools,
    chunks: ChunkCache,
    tiles: TileCache,
    /// Signalled after every tile state change and chunk arrival
    progress: Notify,
    /// Loads attempted while a required neighbor lacked coefficients
    readiness_violations: AtomicU64,
    /// Coefficient sets dropped early under pool pressure
    reclaimed: AtomicU64,
    /// Source of coefficient access stamps
    clock: AtomicU64,
    /// Tiles produced by the first load, handed to the first streamer pass
    first_loaded: Mutex<Vec<CompletedTile>>,
}

impl std::fmt::Debug for TileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileLoader")
            .field("identifier", &self.chunks.identifier())
            .field("levels", &self.levels.len())
            .finish()
    }
}

impl TileLoader {
    /// Create the runtime state for `store`.
    ///
    /// Tiles below the top scale whose parent does not exist can never
    /// receive low-pass data; they start out failed.
    pub fn new(store: CodeblockStore, reader: Arc<dyn RangeReader>, config: &StreamerConfig) -> Arc<Self> {
        let levels = store.levels.iter().map(LevelState::new).collect();
        let pools = CoefficientPools::new(
            store.block_len(),
            config.pool_chunk_blocks,
            config.ll_pool_blocks,
            config.h_pool_blocks,
        );
        let loader = Arc::new(Self {
            chunks: ChunkCache::with_capacity(reader, config.chunk_cache_chunks),
            tiles: TileCache::with_capacity(config.tile_cache_bytes),
            store,
            levels,
            pools,
            progress: Notify::new(),
            readiness_violations: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            first_loaded: Mutex::new(Vec::new()),
        });

        let max_scale = loader.store.max_scale();
        let mut orphans = 0;
        for scale in (0..max_scale).rev() {
            let layout = &loader.store.levels[scale as usize];
            for y in 0..layout.height_in_tiles as i32 {
                for x in 0..layout.width_in_tiles as i32 {
                    if layout.exists(x, y) && !loader.store.levels[scale as usize + 1].exists(x / 2, y / 2) {
                        loader.fail_tile(scale, x, y, "parent tile does not exist");
                        orphans += 1;
                    }
                }
            }
        }
        if orphans > 0 {
            debug!("loader: {} tiles have no parent and are unavailable", orphans);
        }
        loader
    }

    pub fn store(&self) -> &CodeblockStore {
        &self.store
    }

    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.chunks
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tiles
    }

    pub fn pools(&self) -> &CoefficientPools {
        &self.pools
    }

    pub fn level_state(&self, scale: u32) -> Option<&LevelState> {
        self.levels.get(scale as usize)
    }

    /// State of an existing tile.
    pub fn tile_state(&self, scale: u32, x: i32, y: i32) -> Option<&TileState> {
        let layout = self.store.level(scale)?;
        if !layout.exists(x, y) {
            return None;
        }
        self.levels[scale as usize].tiles.get(layout.index(x, y))
    }

    /// Number of loads refused because a neighbor was not ready.
    pub fn readiness_violations(&self) -> u64 {
        self.readiness_violations.load(Ordering::Acquire)
    }

    /// Number of coefficient sets dropped to make room in a pool.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Acquire)
    }

    fn stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take the tiles produced at open time.
    pub fn take_first_loaded(&self) -> Vec<CompletedTile> {
        self.first_loaded
            .lock()
            .map(|mut tiles| std::mem::take(&mut *tiles))
            .unwrap_or_default()
    }

    /// Wait until `predicate` holds for the tile, or the tile does not exist.
    pub async fn wait_until<F>(&self, scale: u32, x: i32, y: i32, predicate: F)
    where
        F: Fn(&TileState) -> bool,
    {
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.tile_state(scale, x, y) {
                Some(state) if !predicate(state) => notified.await,
                _ => return,
            }
        }
    }

    /// Notified after every tile state change and chunk arrival.
    pub fn progress(&self) -> &Notify {
        &self.progress
    }

    pub(crate) fn notify_progress(&self) {
        self.progress.notify_waiters();
    }

    /// Whether the tile and every existing, non-failed neighbor hold both
    /// coefficient sets.
    pub fn neighborhood_ready(&self, scale: u32, x: i32, y: i32) -> bool {
        for dy in -1..=1 {
            for dx in -1..=1 {
                match self.tile_state(scale, x + dx, y + dy) {
                    Some(state) if !state.has(FAILED) && !state.is_ready() => return false,
                    Some(_) => {}
                    None if dx == 0 && dy == 0 => return false,
                    None => {}
                }
            }
        }
        true
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    /// Read the chunk holding tile (`x`, `y`) of `scale`.
    pub async fn load_chunk_for(&self, scale: u32, x: i32, y: i32) -> Result<Bytes, IoError> {
        let chunk_index = self
            .store
            .tile(scale, x, y)
            .map(|t| t.chunk)
            .ok_or_else(|| IoError::Read(format!("tile ({}, {}) of level {} does not exist", x, y, scale)))?;
        self.load_chunk(chunk_index).await
    }

    pub async fn load_chunk(&self, chunk_index: u32) -> Result<Bytes, IoError> {
        let chunk = self
            .store
            .chunk(chunk_index)
            .ok_or_else(|| IoError::Read(format!("no chunk {}", chunk_index)))?;
        let data = self
            .chunks
            .get_or_load(chunk_index, chunk.offset, chunk.size as usize)
            .await?;
        self.notify_progress();
        Ok(data)
    }

    /// Fail every unfinished tile stored in chunk `chunk_index`.
    pub fn fail_chunk(&self, chunk_index: u32, reason: &str) {
        for layout in &self.store.levels {
            for y in 0..layout.height_in_tiles as i32 {
                for x in 0..layout.width_in_tiles as i32 {
                    if let Some(tile) = layout.tile(x, y) {
                        if tile.exists && tile.chunk == chunk_index {
                            self.fail_tile(layout.scale, x, y, reason);
                        }
                    }
                }
            }
        }
    }

    // =========================================================================
    // High-pass decompression
    // =========================================================================

    /// Decode the tile's H codeblocks (and LL codeblocks at the top scale)
    /// from its chunk buffer.
    ///
    /// The caller holds `H_CLAIMED`.
    pub fn decompress_h_for_tile(&self, scale: u32, x: i32, y: i32, chunk_data: &[u8]) -> Result<(), DecodeError> {
        let info = self
            .store
            .tile(scale, x, y)
            .copied()
            .ok_or_else(|| DecodeError::InvalidHeader(format!("tile ({}, {}) of level {} does not exist", x, y, scale)))?;
        let chunk = self
            .store
            .chunk(info.chunk)
            .ok_or_else(|| DecodeError::InvalidHeader(format!("no chunk {}", info.chunk)))?;
        let bw = self.store.block_width as usize;
        let bh = self.store.block_height as usize;

        let decode = |index: u32, sets: usize, block: &mut PooledBlock| -> Result<(), DecodeError> {
            let codeblock = self
                .store
                .codeblock(index)
                .ok_or_else(|| DecodeError::InvalidHeader(format!("no codeblock {}", index)))?;
            let bytes = chunk.codeblock_bytes(chunk_data, codeblock).ok_or_else(|| {
                DecodeError::InvalidHeader(format!("codeblock {} lies outside chunk {}", index, info.chunk))
            })?;
            decode_codeblock(bytes, sets, codeblock.compressor_version, bw, bh, block)
        };

        let mut h: [Option<PooledBlock>; COLOR_COUNT] = Default::default();
        for (color, slot) in h.iter_mut().enumerate() {
            let mut block = self.allocate_block(PoolKind::HighPass)?;
            decode(info.h_codeblocks[color], 3, &mut block)?;
            *slot = Some(block);
        }

        let mut ll: [Option<PooledBlock>; COLOR_COUNT] = Default::default();
        if let Some(ll_codeblocks) = info.ll_codeblocks.filter(|_| scale == self.store.max_scale()) {
            for (color, slot) in ll.iter_mut().enumerate() {
                let mut block = self.allocate_block(PoolKind::LowPass)?;
                decode(ll_codeblocks[color], 1, &mut block)?;
                *slot = Some(block);
            }
        }

        let Some(state) = self.tile_state(scale, x, y) else {
            return Ok(());
        };
        let has_ll = ll.iter().all(Option::is_some);
        {
            let mut coefficients = state.lock();
            if !state.has(FAILED) {
                coefficients.h = h;
                if has_ll {
                    coefficients.ll = ll;
                }
                state.set(if has_ll { HAS_H | HAS_LL } else { HAS_H });
                state.touch(self.stamp());
            }
        }
        state.clear(H_CLAIMED);
        Ok(())
    }

    /// Run a claimed decompression.
    ///
    /// A full pool only releases the claim so the tile is retried later;
    /// any other error fails the tile.
    pub fn run_h_task(&self, scale: u32, x: i32, y: i32, chunk_data: &[u8]) {
        match self.decompress_h_for_tile(scale, x, y, chunk_data) {
            Ok(()) => {}
            Err(DecodeError::PoolExhausted(pool)) => {
                if let Some(state) = self.tile_state(scale, x, y) {
                    state.clear(H_CLAIMED);
                }
                debug!(
                    "loader: high-pass of tile ({}, {}) of level {} deferred, pool '{}' is full",
                    x, y, scale, pool
                );
            }
            Err(e) => {
                if let Some(state) = self.tile_state(scale, x, y) {
                    state.clear(H_CLAIMED);
                }
                self.fail_tile(scale, x, y, &e.to_string());
            }
        }
        self.notify_progress();
    }

    // =========================================================================
    // Reconstruction
    // =========================================================================

    /// Claim the load of a tile and pin the coefficients it reads.
    ///
    /// `done` lists flags that make the claim pointless: the streamer passes
    /// `LOADED`, a rebuild of evicted pixels passes nothing. On
    /// [`LoadClaim::Claimed`] the caller must run [`load_tile`](Self::load_tile),
    /// which releases both the claim and the pins.
    pub fn claim_load(&self, scale: u32, x: i32, y: i32, done: u8) -> LoadClaim {
        let Some(state) = self.tile_state(scale, x, y) else {
            return LoadClaim::NotReady;
        };
        if !state.claim(LOAD_CLAIMED, done) {
            return LoadClaim::Busy;
        }
        match self.pin_neighborhood(scale, x, y) {
            Some(mask) => {
                state.set_pinned(mask);
                LoadClaim::Claimed
            }
            None => {
                state.clear(LOAD_CLAIMED);
                self.notify_progress();
                LoadClaim::NotReady
            }
        }
    }

    /// Give up a load won through [`claim_load`](Self::claim_load) without
    /// running it.
    pub fn abandon_load(&self, scale: u32, x: i32, y: i32) {
        if let Some(state) = self.tile_state(scale, x, y) {
            self.unpin(scale, x, y, state.take_pinned());
            state.clear(LOAD_CLAIMED);
            self.notify_progress();
        }
    }

    /// Pin every existing, non-failed tile of the 3×3 neighborhood.
    ///
    /// Returns the adjacency bits pinned, or `None` (with nothing pinned)
    /// when one of them lacks coefficients.
    fn pin_neighborhood(&self, scale: u32, x: i32, y: i32) -> Option<u16> {
        let stamp = self.stamp();
        let mut mask = 0u16;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let Some(state) = self.tile_state(scale, x + dx, y + dy) else {
                    continue;
                };
                if state.has(FAILED) {
                    continue;
                }
                if !state.pin(stamp) {
                    self.unpin(scale, x, y, mask);
                    return None;
                }
                mask |= adjacency_bit(dx, dy);
            }
        }
        Some(mask)
    }

    fn unpin(&self, scale: u32, x: i32, y: i32, mask: u16) {
        for dy in -1..=1 {
            for dx in -1..=1 {
                if mask & adjacency_bit(dx, dy) == 0 {
                    continue;
                }
                if let Some(state) = self.tile_state(scale, x + dx, y + dy) {
                    state.unpin();
                }
            }
        }
    }

    /// Reconstruct a tile, donate low-pass data to its children and deliver
    /// its pixels.
    ///
    /// The caller won [`claim_load`](Self::claim_load). A first load counts
    /// towards level completion and goes to `sink`; a rebuild of a tile that
    /// was already loaded only refreshes the tile cache and the children
    /// named by `donation`. Returns `None` when the tile failed meanwhile.
    pub fn load_tile(
        &self,
        scale: u32,
        x: i32,
        y: i32,
        sink: Option<&dyn TileSink>,
        donation: &Donation,
    ) -> Option<CompletedTile> {
        let state = self.tile_state(scale, x, y)?;
        let bw = self.store.block_width as usize;
        let bh = self.store.block_height as usize;
        let samples = self.reconstruct_tile(scale, x, y, bw, bh);
        self.unpin(scale, x, y, state.take_pinned());

        let Some(samples) = samples else {
            state.clear(LOAD_CLAIMED);
            if !state.has(FAILED) {
                self.readiness_violations.fetch_add(1, Ordering::AcqRel);
                warn!(
                    "loader: tile ({}, {}) of level {} scheduled before its neighbors were ready",
                    x, y, scale
                );
            }
            return None;
        };

        if scale > 0 {
            self.donate(scale, x, y, &samples, bw, bh, donation);
        }

        let width = self.store.tile_width;
        let height = self.store.tile_height;
        let mut bgra = vec![0u8; width as usize * height as usize * 4];
        ycocg_to_bgra(&samples[0], &samples[1], &samples[2], &mut bgra);
        let bgra = Bytes::from(bgra);

        let previous = state.set(LOADED);
        state.clear(LOAD_CLAIMED);
        if previous & FAILED != 0 {
            return None;
        }

        let layout = &self.store.levels[scale as usize];
        let tile = CompletedTile {
            level: scale,
            tile_index: layout.index(x, y) as u32,
            tile_x: x as u32,
            tile_y: y as u32,
            width,
            height,
            bgra,
        };
        self.tiles.put(TileCacheKey::new(scale, x as u32, y as u32), tile.bgra.clone());
        if previous & LOADED == 0 {
            self.finish_tile(scale, x, y);
            if let Some(sink) = sink {
                sink.deliver(tile.clone());
            }
            debug!("loader: loaded tile ({}, {}) of level {}", x, y, scale);
        } else {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    self.release_if_idle(scale, x + dx, y + dy);
                }
            }
            debug!("loader: rebuilt tile ({}, {}) of level {}", x, y, scale);
        }
        Some(tile)
    }

    /// Run a claimed load and wake everyone waiting on progress.
    pub fn run_load_task(
        &self,
        scale: u32,
        x: i32,
        y: i32,
        sink: Option<&dyn TileSink>,
        donation: &Donation,
    ) -> Option<CompletedTile> {
        let tile = self.load_tile(scale, x, y, sink, donation);
        self.notify_progress();
        tile
    }

    /// Inverse transform of every color channel of one tile.
    ///
    /// `None` when a non-failed tile of the neighborhood lacks coefficients.
    fn reconstruct_tile(&self, scale: u32, x: i32, y: i32, bw: usize, bh: usize) -> Option<[Vec<i16>; COLOR_COUNT]> {
        // Row-major order is ascending index order, so locks are always
        // taken in the same order
        let mut guards = Vec::with_capacity(9);
        for dy in -1..=1 {
            for dx in -1..=1 {
                if let Some(state) = self.tile_state(scale, x + dx, y + dy) {
                    if !state.has(FAILED) {
                        let coefficients = state.lock();
                        // Failing discards under the lock, so this check is stable
                        if state.has(FAILED) {
                            if dx == 0 && dy == 0 {
                                return None;
                            }
                            continue;
                        }
                        if !(coefficients.has_ll() && coefficients.has_h()) {
                            return None;
                        }
                        guards.push((dx, dy, coefficients));
                    } else if dx == 0 && dy == 0 {
                        return None;
                    }
                }
            }
        }

        let mut samples: [Vec<i16>; COLOR_COUNT] = Default::default();
        for (color, out) in samples.iter_mut().enumerate() {
            let mut neighborhood = Neighborhood::default();
            for (dx, dy, coefficients) in &guards {
                if let (Some(ll), Some(h)) = (&coefficients.ll[color], &coefficients.h[color]) {
                    neighborhood.set(*dx, *dy, TileCoefficients { ll, h });
                }
            }
            *out = vec![0i16; 4 * bw * bh];
            reconstruct(&neighborhood, bw, bh, out);
        }
        Some(samples)
    }

    /// Hand each wanted child its quadrant of the reconstructed samples as LL.
    ///
    /// A child whose blocks cannot be allocated is skipped; it gets its
    /// low-pass data when its parent is rebuilt.
    #[allow(clippy::too_many_arguments)]
    fn donate(
        &self,
        scale: u32,
        x: i32,
        y: i32,
        samples: &[Vec<i16>; COLOR_COUNT],
        bw: usize,
        bh: usize,
        donation: &Donation,
    ) {
        let child_scale = scale - 1;
        for qy in 0..2 {
            for qx in 0..2 {
                let (cx, cy) = (2 * x + qx, 2 * y + qy);
                let Some(child) = self.tile_state(child_scale, cx, cy) else {
                    continue;
                };
                if !self.wants_low_pass(donation, child_scale, cx, cy) {
                    continue;
                }
                match self.quadrant_blocks(samples, bw, bh, qx as usize, qy as usize) {
                    Ok(ll) => {
                        let mut coefficients = child.lock();
                        if child.flags() & (FAILED | HAS_LL) == 0 {
                            coefficients.ll = ll;
                            child.set(HAS_LL);
                            child.touch(self.stamp());
                        }
                    }
                    Err(e) => debug!(
                        "loader: low-pass of tile ({}, {}) of level {} deferred: {}",
                        cx, cy, child_scale, e
                    ),
                }
            }
        }
    }

    fn quadrant_blocks(
        &self,
        samples: &[Vec<i16>; COLOR_COUNT],
        bw: usize,
        bh: usize,
        qx: usize,
        qy: usize,
    ) -> Result<[Option<PooledBlock>; COLOR_COUNT], DecodeError> {
        let mut ll: [Option<PooledBlock>; COLOR_COUNT] = Default::default();
        for (color, slot) in ll.iter_mut().enumerate() {
            let mut block = self.allocate_block(PoolKind::LowPass)?;
            extract_quadrant(&samples[color], bw, bh, qx, qy, &mut block);
            *slot = Some(block);
        }
        Ok(ll)
    }

    // =========================================================================
    // Coefficient memory
    // =========================================================================

    /// Whether a tile's coefficients may still be read: it is not failed, and
    /// it or one of its neighbors has not been loaded yet.
    pub fn coefficients_needed(&self, scale: u32, x: i32, y: i32) -> bool {
        let Some(state) = self.tile_state(scale, x, y) else {
            return false;
        };
        let flags = state.flags();
        if flags & FAILED != 0 {
            return false;
        }
        if flags & LOADED == 0 {
            return true;
        }
        let required = self.store.levels[scale as usize].adjacency_mask(x, y);
        state.neighbors_done() & required != required
    }

    /// Whether a donation should hand low-pass data to tile (`x`, `y`).
    pub fn wants_low_pass(&self, donation: &Donation, scale: u32, x: i32, y: i32) -> bool {
        let Some(state) = self.tile_state(scale, x, y) else {
            return false;
        };
        if state.flags() & (FAILED | HAS_LL) != 0 {
            return false;
        }
        match donation {
            Donation::Needed => self.coefficients_needed(scale, x, y),
            Donation::Only(tiles) => tiles.contains(&(x, y)),
        }
    }

    /// Free the tile's coefficients if nothing needs them and nobody holds them.
    pub fn release_if_idle(&self, scale: u32, x: i32, y: i32) -> bool {
        match self.tile_state(scale, x, y) {
            Some(state) if !self.coefficients_needed(scale, x, y) => state.release() != (0, 0),
            _ => false,
        }
    }

    fn allocate_block(&self, kind: PoolKind) -> Result<PooledBlock, DecodeError> {
        let pool = match kind {
            PoolKind::LowPass => &self.pools.ll,
            PoolKind::HighPass => &self.pools.h,
        };
        match pool.allocate() {
            Err(DecodeError::PoolExhausted(name)) => {
                if self.reclaim(kind) == 0 {
                    error!("pool '{}' exhausted at {} blocks", name, pool.capacity());
                    return Err(DecodeError::PoolExhausted(name));
                }
                pool.allocate()
            }
            other => other,
        }
    }

    /// Drop idle coefficient sets, least recently touched first, until a
    /// slice of the pool is free again.
    ///
    /// Claimed and pinned tiles are skipped. Returns the number of blocks of
    /// `kind` given back.
    fn reclaim(&self, kind: PoolKind) -> usize {
        let (flag, pool) = match kind {
            PoolKind::LowPass => (HAS_LL, &self.pools.ll),
            PoolKind::HighPass => (HAS_H, &self.pools.h),
        };
        let mut candidates = Vec::new();
        for (scale, level) in self.levels.iter().enumerate() {
            for (index, state) in level.tiles.iter().enumerate() {
                let flags = state.flags();
                if flags & flag == 0 || flags & (H_CLAIMED | LOAD_CLAIMED) != 0 {
                    continue;
                }
                candidates.push((state.touched(), scale, index));
            }
        }
        candidates.sort_unstable();

        let target = (pool.capacity() / 8).max(COLOR_COUNT);
        let mut freed = 0;
        let mut sets = 0;
        for (_, scale, index) in candidates {
            if freed >= target {
                break;
            }
            let (ll, h) = self.levels[scale].tiles[index].release();
            let blocks = match kind {
                PoolKind::LowPass => ll,
                PoolKind::HighPass => h,
            };
            if ll + h > 0 {
                sets += 1;
            }
            freed += blocks;
        }
        self.reclaimed.fetch_add(sets, Ordering::AcqRel);
        if freed > 0 {
            debug!("loader: reclaimed {} coefficient sets, {} {:?} blocks", sets, freed, kind);
            self.notify_progress();
        }
        freed
    }

    // =========================================================================
    // Completion and failure
    // =========================================================================

    /// Bookkeeping shared by loaded and failed tiles: level completion and
    /// freeing coefficients no neighbor needs anymore.
    fn finish_tile(&self, scale: u32, x: i32, y: i32) {
        let layout = &self.store.levels[scale as usize];
        if self.levels[scale as usize].record_done() {
            info!("Level {} fully loaded", scale);
        }
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                let Some(neighbor) = self.tile_state(scale, nx, ny) else {
                    continue;
                };
                let required = layout.adjacency_mask(nx, ny);
                let done = neighbor.mark_neighbor_done(adjacency_bit(-dx, -dy));
                if done & required == required {
                    neighbor.release();
                }
            }
        }
    }

    /// Mark a tile permanently unavailable, together with every descendant.
    pub fn fail_tile(&self, scale: u32, x: i32, y: i32, reason: &str) {
        let Some(state) = self.tile_state(scale, x, y) else {
            return;
        };
        // Loaded tiles keep their pixels
        if !state.claim(FAILED, LOADED) {
            return;
        }
        state.clear(H_CLAIMED | LOAD_CLAIMED);
        state.discard();
        warn!("Tile ({}, {}) of level {} unavailable: {}", x, y, scale, reason);
        self.finish_tile(scale, x, y);

        if scale > 0 {
            for qy in 0..2 {
                for qx in 0..2 {
                    self.fail_tile(scale - 1, 2 * x + qx, 2 * y + qy, "parent tile failed");
                }
            }
        }
        self.notify_progress();
    }

    // =========================================================================
    // First load
    // =========================================================================

    /// Decode the levels stored in the top chunks in bulk.
    ///
    /// Their combined codeblocks are small, so they are read and
    /// reconstructed in one go when the slide is opened.
    pub async fn first_load(self: &Arc<Self>) {
        let start = Instant::now();
        let max_scale = self.store.max_scale();
        let lowest = (max_scale + 1).saturating_sub(levels_in_chunk(max_scale));

        let mut data = HashMap::new();
        for (index, chunk) in self.store.chunks.iter().enumerate() {
            if chunk.top_scale != max_scale {
                continue;
            }
            let index = index as u32;
            match self.load_chunk(index).await {
                Ok(bytes) => {
                    data.insert(index, bytes);
                }
                Err(e) => {
                    error!("First load: cannot read chunk {}: {}", index, e);
                    self.fail_chunk(index, "top chunk unreadable");
                }
            }
        }

        let loader = Arc::clone(self);
        let produced = tokio::task::spawn_blocking(move || loader.first_load_blocking(lowest, &data)).await;
        match produced {
            Ok(count) => info!(
                "First load: {} tiles in levels {}..={} in {:.1?}",
                count,
                lowest,
                max_scale,
                start.elapsed()
            ),
            Err(e) => error!("First load aborted: {}", e),
        }
    }

    fn first_load_blocking(&self, lowest: u32, data: &HashMap<u32, Bytes>) -> usize {
        let max_scale = self.store.max_scale();
        for scale in lowest..=max_scale {
            let layout = &self.store.levels[scale as usize];
            for y in 0..layout.height_in_tiles as i32 {
                for x in 0..layout.width_in_tiles as i32 {
                    let (Some(info), Some(state)) = (layout.tile(x, y), self.tile_state(scale, x, y)) else {
                        continue;
                    };
                    let Some(bytes) = data.get(&info.chunk) else {
                        continue;
                    };
                    if state.claim(H_CLAIMED, HAS_H) {
                        self.run_h_task(scale, x, y, bytes);
                    }
                }
            }
        }

        let mut produced = Vec::new();
        for scale in (lowest..=max_scale).rev() {
            let layout = &self.store.levels[scale as usize];
            for y in 0..layout.height_in_tiles as i32 {
                for x in 0..layout.width_in_tiles as i32 {
                    if !self.neighborhood_ready(scale, x, y)
                        || self.claim_load(scale, x, y, LOADED) != LoadClaim::Claimed
                    {
                        continue;
                    }
                    if let Some(tile) = self.run_load_task(scale, x, y, None, &Donation::Needed) {
                        produced.push(tile);
                    }
                }
            }
        }

        let count = produced.len();
        if let Ok(mut first_loaded) = self.first_loaded.lock() {
            first_loaded.extend(produced);
        }
        count
    }
}
