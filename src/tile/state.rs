//! Runtime state of every tile.
//!
//! Static geometry lives in [`LevelLayout`]; this module tracks what has
//! happened to each tile since the slide was opened. Readiness flags are
//! atomics. A flag is only ever set by the task that claimed the matching
//! work through [`TileState::claim`], so each transition has a single writer.
//!
//! ```text
//!            claim(H_CLAIMED)          claim(LOAD_CLAIMED)
//!  (empty) ────────────────► HAS_H ───────────────────────► LOADED
//!      │                       ▲                               │
//!      └── parent donates ─► HAS_LL                            ▼
//!                                              coefficients freed once every
//!                                              neighbor is LOADED or FAILED
//! ```
//!
//! Coefficients are a cache: under pool pressure an unpinned set may be
//! dropped early and rebuilt later from the parent and the chunk, so
//! `HAS_LL` and `HAS_H` can be cleared again on a tile that is not done.
//! The flags change only while the coefficient mutex is held.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::allocator::PooledBlock;
use crate::format::isyntax::layout::{LevelLayout, COLOR_COUNT};

/// Low-pass coefficients are present.
pub const HAS_LL: u8 = 1 << 0;
/// High-pass coefficients are present.
pub const HAS_H: u8 = 1 << 1;
/// Pixels were produced.
pub const LOADED: u8 = 1 << 2;
/// A task owns high-pass decompression.
pub const H_CLAIMED: u8 = 1 << 3;
/// A task owns the tile load.
pub const LOAD_CLAIMED: u8 = 1 << 4;
/// The tile can never be produced.
pub const FAILED: u8 = 1 << 5;

/// Coefficient blocks of one tile, one entry per color.
#[derive(Debug, Default)]
pub struct CoefficientSet {
    pub ll: [Option<PooledBlock>; COLOR_COUNT],
    pub h: [Option<PooledBlock>; COLOR_COUNT],
    /// Loads currently reading these blocks
    pub pins: u16,
}

impl CoefficientSet {
    pub fn has_ll(&self) -> bool {
        self.ll.iter().all(Option::is_some)
    }

    pub fn has_h(&self) -> bool {
        self.h.iter().all(Option::is_some)
    }

    /// Blocks held, as `(ll, h)`.
    pub fn block_counts(&self) -> (usize, usize) {
        (
            self.ll.iter().flatten().count(),
            self.h.iter().flatten().count(),
        )
    }

    /// Return every block to its pool.
    pub fn clear(&mut self) {
        self.ll = Default::default();
        self.h = Default::default();
    }
}

/// Mutable state of one tile.
#[derive(Debug, Default)]
pub struct TileState {
    flags: AtomicU8,
    /// Adjacency bits of neighbors (self included) that are loaded or failed
    neighbors_done: AtomicU16,
    /// Adjacency bits pinned by the holder of `LOAD_CLAIMED`
    pinned: AtomicU16,
    /// Last time the coefficients were produced or read
    touched: AtomicU64,
    coefficients: Mutex<CoefficientSet>,
}

impl TileState {
    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags() & flag == flag
    }

    /// Whether both coefficient sets are present.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.has(HAS_LL | HAS_H)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.flags() & (LOADED | FAILED) != 0
    }

    /// Set `flag`; returns the flags before the update.
    pub fn set(&self, flag: u8) -> u8 {
        self.flags.fetch_or(flag, Ordering::AcqRel)
    }

    pub fn clear(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Try to take ownership of `claim`.
    ///
    /// Fails when the claim is already held or any flag in `done` is set.
    pub fn claim(&self, claim: u8, done: u8) -> bool {
        let mut current = self.flags();
        loop {
            if current & (claim | done | FAILED) != 0 {
                return false;
            }
            match self.flags.compare_exchange_weak(
                current,
                current | claim,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a finished neighbor; returns the updated mask.
    pub fn mark_neighbor_done(&self, bit: u16) -> u16 {
        self.neighbors_done.fetch_or(bit, Ordering::AcqRel) | bit
    }

    pub fn neighbors_done(&self) -> u16 {
        self.neighbors_done.load(Ordering::Acquire)
    }

    /// Lock the coefficient blocks.
    pub fn lock(&self) -> MutexGuard<'_, CoefficientSet> {
        // A panicking task leaves the blocks in a usable state
        self.coefficients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn touch(&self, stamp: u64) {
        self.touched.fetch_max(stamp, Ordering::Relaxed);
    }

    pub fn touched(&self) -> u64 {
        self.touched.load(Ordering::Relaxed)
    }

    /// Keep both coefficient sets alive for a reader.
    ///
    /// Fails without pinning when either set is missing.
    pub fn pin(&self, stamp: u64) -> bool {
        let mut coefficients = self.lock();
        if !(coefficients.has_ll() && coefficients.has_h()) {
            return false;
        }
        coefficients.pins += 1;
        self.touch(stamp);
        true
    }

    pub fn unpin(&self) {
        let mut coefficients = self.lock();
        coefficients.pins = coefficients.pins.saturating_sub(1);
    }

    pub fn set_pinned(&self, mask: u16) {
        self.pinned.store(mask, Ordering::Release);
    }

    /// Take the mask stored by [`set_pinned`](Self::set_pinned).
    pub fn take_pinned(&self) -> u16 {
        self.pinned.swap(0, Ordering::AcqRel)
    }

    /// Drop the coefficients unless a task is using them.
    ///
    /// Returns the `(ll, h)` blocks given back to the pools.
    pub fn release(&self) -> (usize, usize) {
        let mut coefficients = self.lock();
        if coefficients.pins > 0 || self.flags() & (H_CLAIMED | LOAD_CLAIMED) != 0 {
            return (0, 0);
        }
        let freed = coefficients.block_counts();
        coefficients.clear();
        self.clear(HAS_LL | HAS_H);
        freed
    }

    /// Drop the coefficients whether or not they are in use.
    pub fn discard(&self) {
        let mut coefficients = self.lock();
        coefficients.clear();
        self.clear(HAS_LL | HAS_H);
    }
}

/// Mutable state of one pyramid level.
#[derive(Debug)]
pub struct LevelState {
    pub tiles: Vec<TileState>,
    /// Tiles loaded or failed
    done: AtomicU32,
    existing: u32,
    complete: AtomicBool,
}

impl LevelState {
    pub fn new(layout: &LevelLayout) -> Self {
        Self {
            tiles: (0..layout.tile_count()).map(|_| TileState::default()).collect(),
            done: AtomicU32::new(0),
            existing: layout.existing_tiles,
            complete: AtomicBool::new(layout.existing_tiles == 0),
        }
    }

    /// Count one more finished tile; returns true when it completes the level.
    pub fn record_done(&self) -> bool {
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= self.existing {
            !self.complete.swap(true, Ordering::AcqRel)
        } else {
            false
        }
    }

    pub fn done_count(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }

    /// Every existing tile is loaded or failed.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}
