//! Work submission and tile delivery.
//!
//! The streamer never runs decode work on its own schedule: it hands closures
//! to a [`WorkQueue`] and receives finished tiles through a [`TileSink`].
//!
//! ```text
//!  TileStreamer::service ──submit──► WorkQueue ──► blocking worker
//!                                                        │
//!              renderer ◄── TileSink::deliver ◄──────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

/// A unit of blocking work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue of blocking tasks.
pub trait WorkQueue: Send + Sync {
    /// Submit a task; returns false when the queue is full.
    fn submit(&self, task: Task) -> bool;

    /// Tasks submitted but not finished.
    fn pending_count(&self) -> usize;

    /// Workers not currently running a task.
    fn idle_worker_count(&self) -> usize;

    /// Number of workers.
    fn worker_count(&self) -> usize;
}

// =============================================================================
// Worker Pool
// =============================================================================

struct PoolCounters {
    pending: AtomicUsize,
    active: AtomicUsize,
}

/// Fixed-size pool of blocking workers on a tokio runtime.
///
/// At most `workers` tasks run at once; up to `capacity` may be queued.
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    workers: usize,
    capacity: usize,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Create a pool on the runtime behind `handle`.
    pub fn new(handle: Handle, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            capacity: capacity.max(1),
            counters: Arc::new(PoolCounters {
                pending: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a pool on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn current(workers: usize, capacity: usize) -> Self {
        Self::new(Handle::current(), workers, capacity)
    }
}

impl WorkQueue for WorkerPool {
    fn submit(&self, task: Task) -> bool {
        let pending = self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if pending >= self.capacity {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        let permits = Arc::clone(&self.permits);
        let counters = Arc::clone(&self.counters);
        self.handle.spawn(async move {
            let permit = permits.acquire_owned().await;
            counters.active.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                debug!("worker task panicked: {}", e);
            }
            counters.active.fetch_sub(1, Ordering::AcqRel);
            counters.pending.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
        true
    }

    fn pending_count(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    fn idle_worker_count(&self) -> usize {
        self.workers
            .saturating_sub(self.counters.active.load(Ordering::Acquire))
    }

    fn worker_count(&self) -> usize {
        self.workers
    }
}

/// Runs every task on the submitting thread.
///
/// Gives deterministic scheduling for tools and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl WorkQueue for InlineQueue {
    fn submit(&self, task: Task) -> bool {
        task();
        true
    }

    fn pending_count(&self) -> usize {
        0
    }

    fn idle_worker_count(&self) -> usize {
        1
    }

    fn worker_count(&self) -> usize {
        1
    }
}

// =============================================================================
// Tile Delivery
// =============================================================================

/// A reconstructed tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTile {
    pub level: u32,
    /// Row-major index within the level
    pub tile_index: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub width: u32,
    pub height: u32,
    /// Packed B, G, R, A bytes
    pub bgra: Bytes,
}

/// Receiver of finished tiles.
///
/// Called from worker threads; implementations must not block for long.
pub trait TileSink: Send + Sync {
    fn deliver(&self, tile: CompletedTile);
}

/// Sink forwarding tiles into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<CompletedTile>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletedTile>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TileSink for ChannelSink {
    fn deliver(&self, tile: CompletedTile) {
        // The renderer went away; nothing left to deliver to
        let _ = self.sender.send(tile);
    }
}

/// Sink collecting tiles in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    tiles: Mutex<Vec<CompletedTile>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything delivered so far.
    pub fn take(&self) -> Vec<CompletedTile> {
        self.tiles
            .lock()
            .map(|mut tiles| std::mem::take(&mut *tiles))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tiles.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TileSink for CollectingSink {
    fn deliver(&self, tile: CompletedTile) {
        if let Ok(mut tiles) = self.tiles.lock() {
            tiles.push(tile);
        }
    }
}
