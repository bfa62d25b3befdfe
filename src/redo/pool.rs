//! Arena block pool for redo IOs.
//!
//! One page-aligned arena is carved into device-block-sized slots.
//! Sequentially allocated slots are physically contiguous, which is what
//! lets adjacent IOs coalesce into one device write. When the arena runs
//! dry, standalone buffers are handed out instead (those never coalesce).

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::util::AlignedBuffer;

struct PoolInner {
    // Kept alive for the arena's lifetime; blocks address it through `base`.
    _arena: AlignedBuffer,
    base: NonNull<u8>,
    block_size: usize,
    /// Free slot indices, highest last, so `pop` hands out ascending slots.
    free: Mutex<Vec<usize>>,
}

// Safety: slot disjointness is enforced by the free list; the arena itself
// is Send + Sync.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

/// Pool of fixed-size blocks cut from one aligned arena.
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Create a pool of `n_blocks` blocks of `block_size` bytes each.
    pub fn new(n_blocks: usize, block_size: usize, alignment: usize) -> Option<Self> {
        let mut arena = AlignedBuffer::zeroed(alignment, n_blocks * block_size)?;
        let base = NonNull::new(arena.as_mut_ptr())?;
        Some(Self {
            inner: Arc::new(PoolInner {
                _arena: arena,
                base,
                block_size,
                free: Mutex::new((0..n_blocks).rev().collect()),
            }),
        })
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Take a block. Contents are unspecified (slots are reused); falls
    /// back to a standalone allocation when the arena is exhausted.
    pub fn alloc(&self) -> Block {
        let slot = self.inner.free.lock().unwrap().pop();
        match slot {
            Some(idx) => Block {
                origin: BlockOrigin::Pooled {
                    pool: Arc::clone(&self.inner),
                    idx,
                },
            },
            None => Block {
                origin: BlockOrigin::Standalone(
                    AlignedBuffer::zeroed(self.inner.block_size.max(512), self.inner.block_size)
                        .expect("standalone block allocation"),
                ),
            },
        }
    }

    /// Take a block and zero it.
    pub fn alloc_zeroed(&self) -> Block {
        let mut block = self.alloc();
        block.as_mut_slice().fill(0);
        block
    }
}

enum BlockOrigin {
    Pooled { pool: Arc<PoolInner>, idx: usize },
    Standalone(AlignedBuffer),
}

/// One device-block-sized buffer, returned to its pool on drop.
pub struct Block {
    origin: BlockOrigin,
}

impl Block {
    /// Pointer to the block data.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.origin {
            // Safety: idx was handed out by the free list, so the offset is
            // in bounds.
            BlockOrigin::Pooled { pool, idx } => unsafe {
                pool.base.as_ptr().add(idx * pool.block_size) as *const u8
            },
            BlockOrigin::Standalone(buf) => buf.as_ptr(),
        }
    }

    /// Block length in bytes.
    pub fn len(&self) -> usize {
        match &self.origin {
            BlockOrigin::Pooled { pool, .. } => pool.block_size,
            BlockOrigin::Standalone(buf) => buf.size(),
        }
    }

    /// Whether the block is zero-length (never, in practice).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice view of the block.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the slot is exclusively owned by this Block.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Mutable slice view of the block.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the slot is exclusively owned by this Block.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr() as *mut u8, self.len()) }
    }

    /// Whether `next` starts exactly where this block's data ends.
    pub fn is_adjacent_to(&self, next: &Block) -> bool {
        (self.as_ptr() as usize) + self.len() == next.as_ptr() as usize
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let BlockOrigin::Pooled { pool, idx } = &self.origin {
            let mut free = pool.free.lock().unwrap();
            free.push(*idx);
            // Keep the hand-out order ascending for contiguity.
            free.sort_unstable_by(|a, b| b.cmp(a));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocs_are_contiguous() {
        let pool = BlockPool::new(8, 512, 4096).unwrap();
        let a = pool.alloc();
        let b = pool.alloc();
        let c = pool.alloc();
        assert!(a.is_adjacent_to(&b));
        assert!(b.is_adjacent_to(&c));
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn test_blocks_return_on_drop() {
        let pool = BlockPool::new(2, 512, 4096).unwrap();
        {
            let _a = pool.alloc();
            let _b = pool.alloc();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
        // Fresh allocations are contiguous again.
        let a = pool.alloc();
        let b = pool.alloc();
        assert!(a.is_adjacent_to(&b));
    }

    #[test]
    fn test_exhaustion_falls_back_to_standalone() {
        let pool = BlockPool::new(1, 512, 4096).unwrap();
        let a = pool.alloc();
        let b = pool.alloc();
        assert_eq!(b.len(), 512);
        assert!(!a.is_adjacent_to(&b));
        assert_eq!(pool.available(), 0);
        drop(b);
        // Standalone blocks do not enter the pool.
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_alloc_zeroed_clears_reused_slot() {
        let pool = BlockPool::new(1, 512, 4096).unwrap();
        {
            let mut a = pool.alloc();
            a.as_mut_slice().fill(0xFF);
        }
        let b = pool.alloc_zeroed();
        assert!(b.as_slice().iter().all(|&x| x == 0));
    }

    #[test]
    fn test_write_read() {
        let pool = BlockPool::new(4, 512, 4096).unwrap();
        let mut a = pool.alloc();
        let mut b = pool.alloc();
        a.as_mut_slice().fill(1);
        b.as_mut_slice().fill(2);
        assert!(a.as_slice().iter().all(|&x| x == 1));
        assert!(b.as_slice().iter().all(|&x| x == 2));
    }
}
