//! Pooled coefficient blocks.
//!
//! Every tile holds a low-pass block and three high-pass blocks per color
//! while it waits for its neighbors. A [`BlockAllocator`] carves those
//! fixed-size blocks out of large chunks: each chunk is filled front to back
//! by a bump pointer, and released blocks go onto a free list of
//! `(chunk, block)` slots that is consulted before any fresh block is carved.
//!
//! ```text
//!   allocate()                                   drop(PooledBlock)
//!      │                                                │
//!      ▼                                                ▼
//!  ┌─────────┐ empty ┌───────────────┐ full ┌─────────┐  ┌─────────┐
//!  │free list├──────►│bump last chunk├─────►│new chunk│  │free list│
//!  └─────────┘       └───────────────┘      └────┬────┘  └─────────┘
//!                                                │ at capacity
//!                                                ▼
//!                                    DecodeError::PoolExhausted
//! ```

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::DecodeError;

/// Default number of blocks per chunk.
pub const DEFAULT_POOL_CHUNK_BLOCKS: usize = 64;

// =============================================================================
// Chunks
// =============================================================================

/// One contiguous run of `blocks × block_len` samples.
struct Chunk {
    memory: NonNull<[i16]>,
    blocks: usize,
}

impl Chunk {
    fn new(blocks: usize, block_len: usize) -> Self {
        let memory = Box::into_raw(vec![0i16; blocks * block_len].into_boxed_slice());
        Self {
            // SAFETY: Box::into_raw never returns null.
            memory: unsafe { NonNull::new_unchecked(memory) },
            blocks,
        }
    }

    /// Start of block `index`.
    fn block_ptr(&self, index: usize, block_len: usize) -> NonNull<i16> {
        debug_assert!(index < self.blocks);
        let base = self.memory.as_ptr() as *mut i16;
        // SAFETY: index < blocks, so the offset stays inside the chunk.
        unsafe { NonNull::new_unchecked(base.add(index * block_len)) }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: memory came from Box::into_raw in Chunk::new and every
        // PooledBlock keeps the owning pool (and so this chunk) alive.
        unsafe { drop(Box::from_raw(self.memory.as_ptr())) }
    }
}

// SAFETY: a chunk is plain sample memory. Access to individual blocks is
// serialized by the free list: a slot is owned by at most one PooledBlock.
unsafe impl Send for Chunk {}

/// Position of a block inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockSlot {
    chunk: u32,
    block: u32,
}

// =============================================================================
// Block Allocator
// =============================================================================

struct PoolInner {
    name: &'static str,
    block_len: usize,
    chunk_blocks: usize,
    capacity_blocks: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct PoolState {
    chunks: Vec<Chunk>,
    /// Bump pointer into the newest chunk
    used_in_last: usize,
    free: Vec<BlockSlot>,
    in_use: usize,
}

impl PoolState {
    fn reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.blocks).sum()
    }
}

/// A bounded pool of equally sized coefficient blocks.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BlockAllocator {
    inner: Arc<PoolInner>,
}

impl BlockAllocator {
    /// Create a pool of `block_len`-sample blocks.
    ///
    /// # Arguments
    ///
    /// * `name` - Pool name used in errors and logs
    /// * `block_len` - Samples per block
    /// * `chunk_blocks` - Blocks per chunk
    /// * `capacity_blocks` - Upper bound on blocks across all chunks
    pub fn new(
        name: &'static str,
        block_len: usize,
        chunk_blocks: usize,
        capacity_blocks: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                block_len,
                chunk_blocks: chunk_blocks.max(1),
                capacity_blocks,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Take a zeroed block from the pool.
    ///
    /// Recycled slots are preferred, then the newest chunk is bumped, then a
    /// new chunk is reserved. Fails with [`DecodeError::PoolExhausted`] once
    /// every block up to the capacity is on loan.
    pub fn allocate(&self) -> Result<PooledBlock, DecodeError> {
        let inner = &self.inner;
        let mut state = inner.lock();

        let slot = match state.free.pop() {
            Some(slot) => slot,
            None => {
                let last_full = state
                    .chunks
                    .last()
                    .map_or(true, |c| state.used_in_last == c.blocks);
                if last_full {
                    let room = inner.capacity_blocks.saturating_sub(state.reserved());
                    if room == 0 {
                        return Err(DecodeError::PoolExhausted(inner.name));
                    }
                    let blocks = room.min(inner.chunk_blocks);
                    state.chunks.push(Chunk::new(blocks, inner.block_len));
                    state.used_in_last = 0;
                }
                let slot = BlockSlot {
                    chunk: (state.chunks.len() - 1) as u32,
                    block: state.used_in_last as u32,
                };
                state.used_in_last += 1;
                slot
            }
        };

        let ptr = state.chunks[slot.chunk as usize].block_ptr(slot.block as usize, inner.block_len);
        state.in_use += 1;
        drop(state);

        let mut block = PooledBlock {
            ptr,
            len: inner.block_len,
            slot,
            pool: Arc::clone(inner),
        };
        block.fill(0);
        Ok(block)
    }

    /// Samples per block.
    pub fn block_len(&self) -> usize {
        self.inner.block_len
    }

    /// Upper bound on blocks.
    pub fn capacity(&self) -> usize {
        self.inner.capacity_blocks
    }

    /// Blocks currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Blocks reserved across all chunks.
    pub fn allocated(&self) -> usize {
        self.inner.lock().reserved()
    }

    /// Chunks reserved so far.
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("name", &self.inner.name)
            .field("block_len", &self.inner.block_len)
            .field("chunk_blocks", &self.inner.chunk_blocks)
            .field("capacity_blocks", &self.inner.capacity_blocks)
            .finish()
    }
}

// =============================================================================
// Pooled Block
// =============================================================================

/// A block on loan from a [`BlockAllocator`]; its slot goes back on the free
/// list when dropped.
pub struct PooledBlock {
    ptr: NonNull<i16>,
    len: usize,
    slot: BlockSlot,
    pool: Arc<PoolInner>,
}

// SAFETY: a PooledBlock is the only handle to its slot until dropped, so it
// behaves like an owned Box<[i16]>.
unsafe impl Send for PooledBlock {}
unsafe impl Sync for PooledBlock {}

impl Deref for PooledBlock {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        // SAFETY: ptr addresses `len` samples inside a chunk owned by `pool`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PooledBlock {
    fn deref_mut(&mut self) -> &mut [i16] {
        // SAFETY: as above, and the slot is not shared with any other block.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.free.push(self.slot);
        state.in_use -= 1;
    }
}

impl std::fmt::Debug for PooledBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PooledBlock({} chunk {} block {}, {} samples)",
            self.pool.name, self.slot.chunk, self.slot.block, self.len
        )
    }
}

/// The low-pass and high-pass pools of one slide.
#[derive(Debug, Clone)]
pub struct CoefficientPools {
    /// One `bw × bh` block per color
    pub ll: BlockAllocator,
    /// HL, LH and HH in one `3 × bw × bh` block per color
    pub h: BlockAllocator,
}

impl CoefficientPools {
    pub fn new(block_len: usize, chunk_blocks: usize, ll_blocks: usize, h_blocks: usize) -> Self {
        Self {
            ll: BlockAllocator::new("ll", block_len, chunk_blocks, ll_blocks),
            h: BlockAllocator::new("h", 3 * block_len, chunk_blocks, h_blocks),
        }
    }
}
