//! Cache of decoded BGRA tiles.
//!
//! Reconstructed tiles are kept so that `decode_tile` and late streamer
//! passes can serve them again after the tile's coefficients were freed.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total size of cached pixel buffers in bytes and evicts
//! least-recently-used entries when the capacity is exceeded.
//!
//! The cache is written from blocking worker threads, so it sits behind a
//! plain mutex rather than an async lock.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;

/// Default cache capacity: 256MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 65_536;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for decoded tiles of one slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    /// Pyramid level (0 = highest resolution)
    pub level: u32,

    /// Tile X coordinate (0-indexed from left)
    pub tile_x: u32,

    /// Tile Y coordinate (0-indexed from top)
    pub tile_y: u32,
}

impl TileCacheKey {
    pub fn new(level: u32, tile_x: u32, tile_y: u32) -> Self {
        Self {
            level,
            tile_x,
            tile_y,
        }
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheState {
    entries: LruCache<TileCacheKey, Bytes>,
    size: usize,
}

/// LRU cache for decoded tiles with size-based capacity.
///
/// # Example
///
/// ```
/// use isyntax_streamer::tile::{TileCache, TileCacheKey};
/// use bytes::Bytes;
///
/// let cache = TileCache::with_capacity(1024 * 1024);
/// let key = TileCacheKey::new(0, 1, 2);
/// cache.put(key, Bytes::from(vec![0u8; 4 * 64 * 64]));
/// assert!(cache.get(&key).is_some());
/// ```
pub struct TileCache {
    state: Mutex<CacheState>,

    /// Maximum total size in bytes
    max_size: usize,
}

impl TileCache {
    /// Create a new tile cache with default capacity (256MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a new tile cache with specified capacity and maximum entries.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum total size of cached tiles in bytes
    /// * `max_entries` - Maximum number of entries in the cache
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(max_entries),
                size: 0,
            }),
            max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a tile, marking it as recently used.
    pub fn get(&self, key: &TileCacheKey) -> Option<Bytes> {
        self.lock().entries.get(key).cloned()
    }

    /// Check if a tile is in the cache without updating LRU order.
    pub fn contains(&self, key: &TileCacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Store a tile.
    ///
    /// If the cache is over capacity after insertion, least-recently-used
    /// entries are evicted until the cache is within capacity.
    pub fn put(&self, key: TileCacheKey, data: Bytes) {
        let data_size = data.len();
        let mut state = self.lock();

        if let Some(old_data) = state.entries.peek(&key) {
            state.size = state.size.saturating_sub(old_data.len());
        }

        // Entry-count eviction happens inside the LRU
        if let Some((evicted_key, evicted)) = state.entries.push(key, data) {
            if evicted_key != key {
                state.size = state.size.saturating_sub(evicted.len());
            }
        }
        state.size += data_size;

        while state.size > self.max_size {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.size = state.size.saturating_sub(evicted.len()),
                None => break,
            }
        }
    }

    /// Remove a tile, returning its data if it was cached.
    pub fn remove(&self, key: &TileCacheKey) -> Option<Bytes> {
        let mut state = self.lock();
        let data = state.entries.pop(key)?;
        state.size = state.size.saturating_sub(data.len());
        Some(data)
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.size = 0;
    }

    /// Get the current number of cached tiles.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the current total size of cached tiles in bytes.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
