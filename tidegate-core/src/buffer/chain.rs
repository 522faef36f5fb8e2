//! Block chain: an unbounded byte stream built from pooled blocks.
//!
//! The chain keeps an ordered queue of blocks (head oldest, tail newest).
//! A producer appends at the tail and a consumer drains from the head, so
//! the queue itself sits behind a short mutex-protected critical section
//! while the aggregate `datasize` counter is atomic and readable from
//! either side without the lock. The head block goes back to the pool
//! exactly when it is fully drained.

use crate::buffer::Block;
use crate::error::{NetError, NetResult};
use crate::pool::BufferPools;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A queue of blocks forming one byte stream.
pub struct BlockChain {
    /// Pool pair blocks are allocated from and returned to.
    pools: Arc<BufferPools>,

    /// Head = oldest readable block, tail = current write target.
    blocks: Mutex<VecDeque<Block>>,

    /// Sum of unread bytes across all blocks. Kept atomic so the producer
    /// and consumer side can both observe it without taking the lock.
    datasize: AtomicUsize,
}

impl BlockChain {
    /// Creates an empty chain. No block is allocated until the first push.
    pub fn new(pools: Arc<BufferPools>) -> Self {
        Self {
            pools,
            blocks: Mutex::new(VecDeque::new()),
            datasize: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Block>> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unread bytes currently buffered in the chain.
    pub fn datasize(&self) -> usize {
        self.datasize.load(Ordering::Relaxed)
    }

    /// True when no unread byte is buffered.
    pub fn is_empty(&self) -> bool {
        self.datasize() == 0
    }

    /// Writable space left in the tail block. An empty chain reports zero
    /// until the first push lazily allocates a block.
    pub fn writable_space(&self) -> usize {
        self.lock().back().map_or(0, Block::writable_len)
    }

    /// Copies `bytes` into the chain, allocating blocks from the pool as
    /// the tail fills up.
    pub fn push(&self, bytes: &[u8]) -> NetResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut blocks = self.lock();
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let need_block = blocks.back().map_or(true, |b| b.writable_len() == 0);
            if need_block {
                let class = self.pools.class_for(remaining.len());
                let block = class.allocate().ok_or(NetError::PoolExhausted)?;
                blocks.push_back(block);
            }

            // Tail exists and has space at this point.
            let tail = blocks.back_mut().ok_or(NetError::PoolExhausted)?;
            let take = remaining.len().min(tail.writable_len());
            tail.writable()[..take].copy_from_slice(&remaining[..take]);
            tail.advance_write(take);
            remaining = &remaining[take..];
        }

        self.datasize.fetch_add(bytes.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Advances the head cursor past `n` already-read bytes, returning any
    /// fully drained head block to the pool.
    pub fn consume(&self, n: usize) {
        let mut blocks = self.lock();
        self.consume_locked(&mut blocks, n);
    }

    fn consume_locked(&self, blocks: &mut VecDeque<Block>, mut n: usize) {
        debug_assert!(n <= self.datasize());
        while n > 0 {
            let Some(head) = blocks.front_mut() else {
                debug_assert!(false, "consume past end of chain");
                break;
            };
            let take = n.min(head.unread());
            head.advance_read(take);
            n -= take;
            self.datasize.fetch_sub(take, Ordering::Relaxed);

            // A block only retires once read and write both hit capacity;
            // a drained partial tail keeps accepting writes.
            if head.is_retired() {
                let block = blocks.pop_front().unwrap_or_else(|| unreachable!());
                self.pools.class_of(&block).free(block);
            } else if head.is_drained() {
                break;
            }
        }
    }

    /// Runs `f` over the readable span of the head block only. Returns
    /// `None` when nothing is readable. Multi-block operations loop, acting
    /// on one head span per call.
    pub fn with_readable<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let blocks = self.lock();
        for block in blocks.iter() {
            let span = block.readable();
            if !span.is_empty() {
                return Some(f(span));
            }
        }
        None
    }

    /// Copies and consumes exactly `n` bytes, or returns `None` when fewer
    /// are buffered.
    pub fn read_bytes(&self, n: usize) -> Option<Vec<u8>> {
        if self.datasize() < n {
            return None;
        }

        let mut blocks = self.lock();
        let mut out = Vec::with_capacity(n);
        let mut remaining = n;
        for block in blocks.iter() {
            if remaining == 0 {
                break;
            }
            let span = block.readable();
            let take = remaining.min(span.len());
            out.extend_from_slice(&span[..take]);
            remaining -= take;
        }
        debug_assert_eq!(remaining, 0);
        self.consume_locked(&mut blocks, n);
        Some(out)
    }

    /// Feeds readable head spans to `f` until the chain is empty or `f`
    /// accepts fewer bytes than offered (a short write). Returns the total
    /// number of bytes consumed.
    pub fn drain_with(
        &self,
        mut f: impl FnMut(&[u8]) -> NetResult<usize>,
    ) -> NetResult<usize> {
        let mut total = 0;
        loop {
            let mut blocks = self.lock();
            let Some(span_len) = blocks
                .iter()
                .map(|b| b.readable().len())
                .find(|len| *len > 0)
            else {
                return Ok(total);
            };

            let accepted = {
                let span = blocks
                    .iter()
                    .map(Block::readable)
                    .find(|s| !s.is_empty())
                    .unwrap_or_else(|| unreachable!());
                f(span)?
            };
            self.consume_locked(&mut blocks, accepted);
            total += accepted;
            if accepted < span_len {
                return Ok(total);
            }
        }
    }

    /// Applies `f` in place to every written-but-untransformed span and
    /// advances each block's transform cursor.
    pub fn transform_pending(&self, mut f: impl FnMut(&mut [u8])) {
        let mut blocks = self.lock();
        for block in blocks.iter_mut() {
            let span = block.untransformed();
            if span.is_empty() {
                continue;
            }
            let len = span.len();
            f(span);
            block.advance_transform(len);
        }
    }

    /// Returns every block to the pool and zeroes the counter.
    pub fn clear(&self) {
        let mut blocks = self.lock();
        while let Some(block) = blocks.pop_front() {
            self.pools.class_of(&block).free(block);
        }
        self.datasize.store(0, Ordering::Relaxed);
    }
}

impl Drop for BlockChain {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn small_pools() -> Arc<BufferPools> {
        Arc::new(BufferPools::new(8, 64, 32, 8))
    }

    #[test]
    fn test_lazy_allocation_and_writable_space() {
        let chain = BlockChain::new(small_pools());
        assert_eq!(chain.writable_space(), 0);
        assert!(chain.is_empty());

        chain.push(b"abc").unwrap();
        assert_eq!(chain.datasize(), 3);
        assert_eq!(chain.writable_space(), 5);
    }

    #[test]
    fn test_push_spans_blocks_and_read_bytes_joins_them() {
        let chain = BlockChain::new(small_pools());
        let payload: Vec<u8> = (0u8..20).collect();
        chain.push(&payload).unwrap();
        assert_eq!(chain.datasize(), 20);

        // Head views never span blocks.
        let head_len = chain.with_readable(|span| span.len()).unwrap();
        assert!(head_len <= 8);

        let out = chain.read_bytes(20).unwrap();
        assert_eq!(out, payload);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_head_block_freed_only_when_fully_drained() {
        let pools = small_pools();
        let chain = BlockChain::new(pools.clone());

        // Fill exactly one small block.
        chain.push(&[7u8; 8]).unwrap();
        assert_eq!(pools.total_in_use(), 1);

        chain.consume(7);
        // Still one unread byte: the block must stay alive.
        assert_eq!(pools.total_in_use(), 1);
        assert_eq!(chain.datasize(), 1);

        chain.consume(1);
        assert_eq!(pools.total_in_use(), 0);
    }

    #[test]
    fn test_drained_partial_tail_keeps_accepting_writes() {
        let pools = small_pools();
        let chain = BlockChain::new(pools.clone());

        chain.push(b"abcd").unwrap();
        chain.consume(4);
        assert!(chain.is_empty());
        // Partially filled tail was drained but not retired.
        assert_eq!(pools.total_in_use(), 1);

        chain.push(b"wxyz").unwrap();
        assert_eq!(chain.read_bytes(4).unwrap(), b"wxyz");
        assert_eq!(pools.total_in_use(), 0);
    }

    #[test]
    fn test_big_pushes_use_big_blocks() {
        let pools = small_pools();
        let chain = BlockChain::new(pools.clone());

        chain.push(&[1u8; 30]).unwrap();
        assert_eq!(pools.big.in_use(), 1);
        assert_eq!(chain.datasize(), 30);
        drop(chain);
        assert_eq!(pools.total_in_use(), 0);
    }

    #[test]
    fn test_drain_with_stops_on_short_write() {
        let chain = BlockChain::new(small_pools());
        chain.push(&[5u8; 12]).unwrap();

        // Accept only three bytes of the first span.
        let drained = chain.drain_with(|span| Ok(span.len().min(3))).unwrap();
        assert_eq!(drained, 3);
        assert_eq!(chain.datasize(), 9);

        // Accept everything.
        let drained = chain.drain_with(|span| Ok(span.len())).unwrap();
        assert_eq!(drained, 9);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_transform_pending_covers_new_writes_once() {
        let chain = BlockChain::new(small_pools());
        chain.push(&[0u8; 6]).unwrap();
        chain.transform_pending(|span| {
            for b in span.iter_mut() {
                *b ^= 0xff;
            }
        });

        chain.push(&[0u8; 4]).unwrap();
        chain.transform_pending(|span| {
            for b in span.iter_mut() {
                *b ^= 0xff;
            }
        });

        // Each byte was transformed exactly once.
        let out = chain.read_bytes(10).unwrap();
        assert_eq!(out, vec![0xff; 10]);
    }

    #[test]
    fn test_datasize_invariant_under_random_ops() {
        let pools = small_pools();
        let chain = BlockChain::new(pools.clone());
        let mut rng = rand::thread_rng();
        let mut expected = 0usize;

        for _ in 0..2000 {
            if rng.gen_bool(0.6) {
                let n = rng.gen_range(1..24);
                let data = vec![rng.gen::<u8>(); n];
                if chain.push(&data).is_ok() {
                    expected += n;
                }
            } else if expected > 0 {
                let n = rng.gen_range(1..=expected);
                chain.consume(n);
                expected -= n;
            }
            assert_eq!(chain.datasize(), expected);
        }

        chain.consume(expected);
        drop(chain);
        assert_eq!(pools.total_in_use(), 0);
    }
}
