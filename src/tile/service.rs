//! On-demand tile decoding.
//!
//! `decode_tile` serves one tile outside the streamer's frame loop. It is
//! used by tools and tests, and by renderers that need a specific tile now.
//!
//! # Dependency Cone
//!
//! A tile can only be reconstructed once it and its 8 neighbors hold both
//! coefficient sets, and low-pass data only arrives from a loaded parent.
//! The request is therefore planned upward and executed downward:
//!
//! ```text
//!   scale s+2        [P']                 ▲ plan: tiles lacking LL add
//!                   /    \                │ their parent one scale up
//!   scale s+1    [P]      [P]             │
//!               / | \    / | \            │ execute: top scale first,
//!   scale s    n  n  n  n  T  n ...       ▼ H for the 3×3, then load
//! ```
//!
//! Work another task already owns is waited for through the loader's
//! progress notification rather than duplicated.
//!
//! Coefficients are only a cache, so the cone is replanned from scratch when
//! a step finds them gone (reclaimed under pool pressure, or freed after the
//! tile was loaded). A loaded tile whose pixels left the tile cache is simply
//! rebuilt the same way.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::TileCacheKey;
use super::loader::{Donation, LoadClaim, TileLoader};
use super::queue::CompletedTile;
use super::state::{FAILED, HAS_H, HAS_LL, H_CLAIMED, LOAD_CLAIMED};
use crate::error::TileError;

/// Plans tried by one request before it reports [`TileOutcome::Pending`].
const CONE_ATTEMPTS: usize = 16;

// =============================================================================
// Tile Outcome
// =============================================================================

/// Result of a `decode_tile` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileOutcome {
    /// The reconstructed tile
    Pixels(CompletedTile),

    /// Another task is reconstructing this tile right now, or its
    /// prerequisites could not all be held in memory at once; retry later
    Pending,

    /// The tile does not exist or failed to decode
    Unavailable,
}

impl TileOutcome {
    pub fn pixels(&self) -> Option<&CompletedTile> {
        match self {
            TileOutcome::Pixels(tile) => Some(tile),
            _ => None,
        }
    }
}

// =============================================================================
// Force Path
// =============================================================================

/// A step found its inputs gone; the cone has to be planned again.
#[derive(Debug)]
struct Retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    /// Reconstruct the tile itself
    Pixels,
    /// Only give the tile its low-pass data
    LowPass,
}

/// Work of one request, indexed by scale.
#[derive(Debug)]
struct ConePlan {
    /// Tiles to reconstruct
    targets: Vec<BTreeSet<(i32, i32)>>,
    /// Tiles whose low-pass data the scale below depends on
    wanted: Vec<BTreeSet<(i32, i32)>>,
}

fn neighborhood(x: i32, y: i32) -> impl Iterator<Item = (i32, i32)> {
    (-1..=1).flat_map(move |dy| (-1..=1).map(move |dx| (x + dx, y + dy)))
}

impl TileLoader {
    /// Decode tile (`x`, `y`) of `level`, loading every prerequisite.
    ///
    /// # Errors
    ///
    /// Returns an error if the level or coordinates are out of range.
    /// Decode failures are reported as [`TileOutcome::Unavailable`].
    pub async fn decode_tile(self: &Arc<Self>, level: u32, x: u32, y: u32) -> Result<TileOutcome, TileError> {
        let store = self.store();
        let layout = store.level(level).ok_or(TileError::InvalidLevel {
            level,
            max_levels: store.level_count() as u32,
        })?;
        if x >= layout.width_in_tiles || y >= layout.height_in_tiles {
            return Err(TileError::TileOutOfBounds {
                level,
                x,
                y,
                max_x: layout.width_in_tiles,
                max_y: layout.height_in_tiles,
            });
        }
        let (xi, yi) = (x as i32, y as i32);

        for attempt in 0..CONE_ATTEMPTS {
            let Some(state) = self.tile_state(level, xi, yi) else {
                return Ok(TileOutcome::Unavailable);
            };
            if let Some(tile) = self.cached_tile(level, xi, yi) {
                return Ok(TileOutcome::Pixels(tile));
            }
            if state.has(FAILED) {
                return Ok(TileOutcome::Unavailable);
            }
            if state.has(LOAD_CLAIMED) {
                return Ok(TileOutcome::Pending);
            }
            if attempt > 0 {
                debug!("decode_tile: replanning tile ({}, {}) of level {}, attempt {}", x, y, level, attempt + 1);
                tokio::task::yield_now().await;
            }
            if let Ok(Some(tile)) = self.run_cone(level, xi, yi, Goal::Pixels).await {
                return Ok(TileOutcome::Pixels(tile));
            }
        }

        match self.tile_state(level, xi, yi) {
            Some(state) if !state.has(FAILED) => {
                warn!("decode_tile: tile ({}, {}) of level {} still pending", x, y, level);
                Ok(TileOutcome::Pending)
            }
            _ => Ok(TileOutcome::Unavailable),
        }
    }

    /// Give tile (`x`, `y`) of `scale` its low-pass data again by rebuilding
    /// its ancestors.
    ///
    /// Used for tiles whose parent is loaded but whose low-pass blocks were
    /// reclaimed or never donated. Returns false when the tile still lacks
    /// them after every attempt.
    pub async fn restore_low_pass(self: &Arc<Self>, scale: u32, x: i32, y: i32) -> bool {
        for attempt in 0..CONE_ATTEMPTS {
            match self.tile_state(scale, x, y) {
                Some(state) if state.flags() & (HAS_LL | FAILED) == 0 => {}
                _ => return true,
            }
            if attempt > 0 {
                tokio::task::yield_now().await;
            }
            let _ = self.run_cone(scale, x, y, Goal::LowPass).await;
        }
        self.tile_state(scale, x, y)
            .map_or(true, |s| s.flags() & (HAS_LL | FAILED) != 0)
    }

    fn cached_tile(&self, level: u32, x: i32, y: i32) -> Option<CompletedTile> {
        let bgra = self.tile_cache().get(&TileCacheKey::new(level, x as u32, y as u32))?;
        let layout = self.store().level(level)?;
        Some(CompletedTile {
            level,
            tile_index: layout.index(x, y) as u32,
            tile_x: x as u32,
            tile_y: y as u32,
            width: self.store().tile_width,
            height: self.store().tile_height,
            bgra,
        })
    }

    /// Execute one plan, top scale first.
    ///
    /// Returns the target's pixels for [`Goal::Pixels`], `Ok(None)` when the
    /// goal was met some other way or the target failed.
    async fn run_cone(self: &Arc<Self>, level: u32, x: i32, y: i32, goal: Goal) -> Result<Option<CompletedTile>, Retry> {
        let plan = self.plan_cone(level, x, y, goal);
        let max_scale = self.store().max_scale();

        for scale in (level..=max_scale).rev() {
            let targets = &plan.targets[scale as usize];
            if targets.is_empty() {
                continue;
            }
            let donation = match scale.checked_sub(1) {
                Some(below) => Donation::Only(plan.wanted[below as usize].clone()),
                None => Donation::Needed,
            };
            for &(tx, ty) in targets {
                for (nx, ny) in neighborhood(tx, ty) {
                    self.ensure_h(scale, nx, ny).await?;
                }
                let want_pixels = goal == Goal::Pixels && scale == level && (tx, ty) == (x, y);
                let tile = self.ensure_reconstructed(scale, tx, ty, want_pixels, &donation).await?;
                if want_pixels {
                    return Ok(tile);
                }
            }
            for &(tx, ty) in targets {
                for (nx, ny) in neighborhood(tx, ty) {
                    self.release_if_idle(scale, nx, ny);
                }
            }
        }

        match self.tile_state(level, x, y) {
            Some(state) if goal == Goal::LowPass && state.flags() & (HAS_LL | FAILED) == 0 => Err(Retry),
            _ => Ok(None),
        }
    }

    /// Plan the cone upward from the request.
    ///
    /// Every non-failed tile the request depends on that lacks low-pass data
    /// adds its parent as a target one scale up; the parent's 3×3 becomes a
    /// dependency in turn.
    fn plan_cone(&self, level: u32, x: i32, y: i32, goal: Goal) -> ConePlan {
        let max_scale = self.store().max_scale();
        let levels = max_scale as usize + 1;
        let mut plan = ConePlan {
            targets: vec![BTreeSet::new(); levels],
            wanted: vec![BTreeSet::new(); levels],
        };

        let mut needs: BTreeSet<(i32, i32)> = match goal {
            Goal::Pixels => {
                plan.targets[level as usize].insert((x, y));
                neighborhood(x, y).collect()
            }
            Goal::LowPass => BTreeSet::from([(x, y)]),
        };
        for scale in level..max_scale {
            needs.retain(|&(nx, ny)| self.tile_state(scale, nx, ny).map_or(false, |s| !s.has(FAILED)));
            let parents: BTreeSet<(i32, i32)> = needs
                .iter()
                .filter(|&&(nx, ny)| self.tile_state(scale, nx, ny).map_or(false, |s| !s.has(HAS_LL)))
                .map(|&(nx, ny)| (nx.div_euclid(2), ny.div_euclid(2)))
                .collect();
            plan.wanted[scale as usize] = std::mem::take(&mut needs);
            if parents.is_empty() {
                break;
            }
            needs = parents.iter().flat_map(|&(px, py)| neighborhood(px, py)).collect();
            plan.targets[scale as usize + 1] = parents;
        }
        plan
    }

    /// Make sure the tile has high-pass data, or has failed.
    async fn ensure_h(self: &Arc<Self>, scale: u32, x: i32, y: i32) -> Result<(), Retry> {
        loop {
            let Some(state) = self.tile_state(scale, x, y) else {
                return Ok(());
            };
            if state.flags() & (HAS_H | FAILED) != 0 {
                return Ok(());
            }
            if !state.claim(H_CLAIMED, HAS_H) {
                self.wait_until(scale, x, y, |s| s.flags() & (HAS_H | FAILED) != 0 || !s.has(H_CLAIMED))
                    .await;
                continue;
            }

            match self.load_chunk_for(scale, x, y).await {
                Ok(data) => {
                    let loader = Arc::clone(self);
                    let task = tokio::task::spawn_blocking(move || loader.run_h_task(scale, x, y, &data));
                    if let Err(e) = task.await {
                        warn!("decode_tile: decompression task aborted: {}", e);
                        state.clear(H_CLAIMED);
                        self.fail_tile(scale, x, y, "decompression task aborted");
                    }
                }
                Err(e) => {
                    state.clear(H_CLAIMED);
                    self.fail_tile(scale, x, y, &e.to_string());
                }
            }
            // A full pool or a loaded tile that cannot be failed leaves no H
            return if state.flags() & (HAS_H | FAILED) != 0 {
                Ok(())
            } else {
                Err(Retry)
            };
        }
    }

    /// Reconstruct the tile when its pixels or its children's low-pass data
    /// are wanted.
    ///
    /// Returns the pixels this call produced, or the cached ones when
    /// `want_pixels` is set and another task got there first.
    async fn ensure_reconstructed(
        self: &Arc<Self>,
        scale: u32,
        x: i32,
        y: i32,
        want_pixels: bool,
        donation: &Donation,
    ) -> Result<Option<CompletedTile>, Retry> {
        loop {
            let Some(state) = self.tile_state(scale, x, y) else {
                return Ok(None);
            };
            if state.has(FAILED) {
                return Ok(None);
            }
            if want_pixels {
                if let Some(tile) = self.cached_tile(scale, x, y) {
                    return Ok(Some(tile));
                }
            } else if !self.children_lack_low_pass(scale, x, y, donation) {
                return Ok(None);
            }
            match self.claim_load(scale, x, y, 0) {
                LoadClaim::Claimed => break,
                LoadClaim::Busy => {
                    self.wait_until(scale, x, y, |s| !s.has(LOAD_CLAIMED) || s.has(FAILED))
                        .await;
                }
                LoadClaim::NotReady => return Err(Retry),
            }
        }

        let loader = Arc::clone(self);
        let owned = donation.clone();
        let task = tokio::task::spawn_blocking(move || loader.run_load_task(scale, x, y, None, &owned));
        match task.await {
            Ok(Some(tile)) => Ok(Some(tile)),
            Ok(None) => match self.tile_state(scale, x, y) {
                Some(state) if !state.has(FAILED) => Err(Retry),
                _ => Ok(None),
            },
            Err(e) => {
                warn!("decode_tile: load task aborted: {}", e);
                self.fail_tile(scale, x, y, "load task aborted");
                Ok(None)
            }
        }
    }

    fn children_lack_low_pass(&self, scale: u32, x: i32, y: i32, donation: &Donation) -> bool {
        let Some(child_scale) = scale.checked_sub(1) else {
            return false;
        };
        (0..2)
            .flat_map(|qy| (0..2).map(move |qx| (2 * x + qx, 2 * y + qy)))
            .any(|(cx, cy)| self.wants_low_pass(donation, child_scale, cx, cy))
    }
}
