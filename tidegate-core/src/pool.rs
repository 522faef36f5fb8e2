//! Fixed-size block pool.
//!
//! The engine treats the pool as an external get/free service: it asks for
//! a block and either receives one or learns the class is exhausted. Two
//! size classes exist (small blocks for ordinary traffic, big blocks for
//! large pushes); each class keeps its free list behind its own lock so any
//! worker thread can allocate.

use crate::buffer::Block;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// A pool of equally sized blocks with a hard ceiling.
pub struct BlockPool {
    /// Size of every block in this class.
    block_size: usize,

    /// Maximum number of blocks this class will ever create.
    capacity: usize,

    /// Blocks returned by their users, ready for reuse.
    free: Mutex<Vec<Block>>,

    /// Blocks created so far (monotonic, bounded by `capacity`).
    created: AtomicUsize,

    /// Blocks currently handed out.
    in_use: AtomicUsize,
}

impl BlockPool {
    /// Creates a pool for `capacity` blocks of `block_size` bytes each.
    /// Blocks are created lazily on first demand.
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
            free: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Size of blocks in this class.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Ceiling on the number of blocks this class creates.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks currently handed out. Returns to zero once every
    /// consumer has released its buffers.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Hands out a block, reusing a freed one when possible. Returns `None`
    /// when the class has hit its ceiling and nothing is free.
    pub fn allocate(&self) -> Option<Block> {
        let recycled = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        let block = match recycled {
            Some(block) => block,
            None => {
                // Grow lazily until the ceiling.
                let mut created = self.created.load(Ordering::Relaxed);
                loop {
                    if created >= self.capacity {
                        warn!(
                            block_size = self.block_size,
                            capacity = self.capacity,
                            "block pool exhausted"
                        );
                        return None;
                    }
                    match self.created.compare_exchange(
                        created,
                        created + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(current) => created = current,
                    }
                }
                Block::new(self.block_size)
            }
        };

        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    /// Returns a block to the free list for reuse.
    pub fn free(&self, mut block: Block) {
        debug_assert_eq!(block.capacity(), self.block_size);
        block.reset();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(block);
    }
}

/// Both block classes the engine allocates from.
pub struct BufferPools {
    /// Small blocks for ordinary traffic.
    pub small: BlockPool,

    /// Big blocks for pushes larger than a small block.
    pub big: BlockPool,
}

impl BufferPools {
    /// Creates both size classes.
    pub fn new(
        small_size: usize,
        small_count: usize,
        big_size: usize,
        big_count: usize,
    ) -> Self {
        Self {
            small: BlockPool::new(small_size, small_count),
            big: BlockPool::new(big_size, big_count),
        }
    }

    /// Picks the class for a push of `len` pending bytes.
    pub fn class_for(&self, len: usize) -> &BlockPool {
        if len > self.small.block_size() {
            &self.big
        } else {
            &self.small
        }
    }

    /// The class a given block belongs to, identified by capacity.
    pub fn class_of(&self, block: &Block) -> &BlockPool {
        if block.capacity() == self.big.block_size() {
            &self.big
        } else {
            &self.small
        }
    }

    /// Total blocks handed out across both classes.
    pub fn total_in_use(&self) -> usize {
        self.small.in_use() + self.big.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_cycles() {
        let pool = BlockPool::new(64, 2);
        assert_eq!(pool.in_use(), 0);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.in_use(), 2);

        // Ceiling reached.
        assert!(pool.allocate().is_none());

        pool.free(a);
        assert_eq!(pool.in_use(), 1);

        // The freed block is reused rather than created anew.
        let c = pool.allocate().unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.free(b);
        pool.free(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_freed_blocks_come_back_reset() {
        let pool = BlockPool::new(8, 1);
        let mut block = pool.allocate().unwrap();
        block.writable()[..3].copy_from_slice(b"abc");
        block.advance_write(3);
        pool.free(block);

        let block = pool.allocate().unwrap();
        assert_eq!(block.unread(), 0);
        assert_eq!(block.writable_len(), 8);
        pool.free(block);
    }

    #[test]
    fn test_class_selection() {
        let pools = BufferPools::new(16, 4, 64, 2);
        assert_eq!(pools.class_for(10).block_size(), 16);
        assert_eq!(pools.class_for(16).block_size(), 16);
        assert_eq!(pools.class_for(17).block_size(), 64);

        let big = pools.big.allocate().unwrap();
        assert_eq!(pools.class_of(&big).block_size(), 64);
        pools.big.free(big);
        assert_eq!(pools.total_in_use(), 0);
    }
}
