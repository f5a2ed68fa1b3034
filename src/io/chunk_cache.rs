use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock};

use super::RangeReader;
use crate::error::IoError;

/// Default cache capacity in number of chunks.
///
/// A chunk spans up to three pyramid levels of one 2^k tile block, typically
/// a few hundred kilobytes.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 256;

/// Chunk-granular caching layer over a RangeReader.
///
/// Every tile decode reads its codeblocks out of a DataChunk, a contiguous
/// on-disk region that is fetched as one I/O. This cache keeps recently used
/// chunks resident:
/// - LRU eviction bounds memory to `capacity` chunks
/// - Singleflight: concurrent requests for the same chunk share one read
/// - Evicting a chunk never invalidates in-flight decodes, because tasks hold
///   their own `Bytes` handle to the buffer
pub struct ChunkCache {
    /// The underlying reader
    inner: Arc<dyn RangeReader>,
    /// Resident chunks indexed by chunk number
    cache: RwLock<LruCache<u32, Bytes>>,
    /// In-flight chunk reads for the singleflight pattern
    in_flight: Mutex<HashMap<u32, Arc<Notify>>>,
}

impl ChunkCache {
    /// Create a cache with the default capacity.
    pub fn new(inner: Arc<dyn RangeReader>) -> Self {
        Self::with_capacity(inner, DEFAULT_CHUNK_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `capacity` chunks (minimum 1).
    pub fn with_capacity(inner: Arc<dyn RangeReader>, capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity).unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            inner,
            cache: RwLock::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Get a chunk from the cache or read it from the underlying reader.
    ///
    /// If multiple tasks request the same chunk concurrently, only one read
    /// is performed and all tasks share the result.
    pub async fn get_or_load(&self, index: u32, offset: u64, len: usize) -> Result<Bytes, IoError> {
        loop {
            // Fast path: check cache
            {
                let mut cache = self.cache.write().await;
                if let Some(data) = cache.get(&index) {
                    return Ok(data.clone());
                }
            }

            // Slow path: wait for an in-flight read or become leader
            let notify = {
                let mut in_flight = self.in_flight.lock().await;

                if let Some(notify) = in_flight.get(&index) {
                    let notify = notify.clone();
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    // Register before releasing the lock so the leader's wakeup is not lost
                    notified.as_mut().enable();
                    drop(in_flight);
                    notified.await;
                    continue;
                }

                let notify = Arc::new(Notify::new());
                in_flight.insert(index, notify.clone());
                notify
            };

            let result = self.inner.read_exact_at(offset, len).await;

            {
                let mut cache = self.cache.write().await;
                let mut in_flight = self.in_flight.lock().await;

                if let Ok(ref data) = result {
                    cache.put(index, data.clone());
                }

                in_flight.remove(&index);
            }

            notify.notify_waiters();

            return result;
        }
    }

    /// Non-blocking residency check used by the per-frame scheduler.
    ///
    /// Returns `None` when the chunk is absent or the cache is momentarily
    /// locked by a writer; the scheduler simply retries on its next pass.
    pub fn try_get(&self, index: u32) -> Option<Bytes> {
        let cache = self.cache.try_read().ok()?;
        cache.peek(&index).cloned()
    }

    /// Check whether a chunk is resident without touching LRU order.
    pub async fn contains(&self, index: u32) -> bool {
        self.cache.read().await.contains(&index)
    }

    /// Number of resident chunks.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Check if no chunk is resident.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Identifier of the underlying reader.
    pub fn identifier(&self) -> &str {
        self.inner.identifier()
    }
}
