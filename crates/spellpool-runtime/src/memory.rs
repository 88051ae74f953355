//! Recyclable fixed-size scratch buffers.
//!
//! The pool owns one of these for its callers (host functions, batch
//! drivers). Value conversion allocates on its own and never touches it,
//! so the hit and miss counters only reflect caller traffic.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryPoolStats {
    pub enabled: bool,
    pub block_size: usize,
    pub pooled_blocks: usize,
    pub hits: u64,
    pub misses: u64,
}

/// A free list of zeroed `block_size` buffers, capped at `capacity`.
///
/// When disabled, `get_block` simply allocates and `put_block` drops.
#[derive(Debug)]
pub struct MemoryBlockPool {
    enabled: bool,
    block_size: usize,
    capacity: usize,
    blocks: Mutex<Vec<Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryBlockPool {
    pub fn new(enabled: bool, capacity: usize, block_size: usize) -> Self {
        let blocks = if enabled {
            (0..capacity).map(|_| vec![0u8; block_size]).collect()
        } else {
            Vec::new()
        };
        Self {
            enabled,
            block_size,
            capacity,
            blocks: Mutex::new(blocks),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn disabled(block_size: usize) -> Self {
        Self::new(false, 0, block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn get_block(&self) -> Vec<u8> {
        if !self.enabled {
            return vec![0u8; self.block_size];
        }
        let pooled = self.blocks.lock().expect("memory pool lock").pop();
        match pooled {
            Some(block) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.block_size]
            }
        }
    }

    /// Return a block. Blocks of the wrong size, or beyond capacity, are
    /// dropped.
    pub fn put_block(&self, mut block: Vec<u8>) {
        if !self.enabled || block.len() != self.block_size {
            return;
        }
        block.fill(0);
        let mut blocks = self.blocks.lock().expect("memory pool lock");
        if blocks.len() < self.capacity {
            blocks.push(block);
        }
    }

    /// Release every pooled block.
    pub fn clear(&self) {
        self.blocks.lock().expect("memory pool lock").clear();
    }

    pub fn stats(&self) -> MemoryPoolStats {
        MemoryPoolStats {
            enabled: self.enabled,
            block_size: self.block_size,
            pooled_blocks: self.blocks.lock().expect("memory pool lock").len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preallocates_and_counts_hits() {
        let pool = MemoryBlockPool::new(true, 2, 16);
        assert_eq!(pool.stats().pooled_blocks, 2);
        let a = pool.get_block();
        let b = pool.get_block();
        let c = pool.get_block();
        assert_eq!(a.len(), 16);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
        drop((b, c));
    }

    #[test]
    fn returned_blocks_are_zeroed() {
        let pool = MemoryBlockPool::new(true, 1, 8);
        let mut block = pool.get_block();
        block.copy_from_slice(&[7; 8]);
        pool.put_block(block);
        assert_eq!(pool.get_block(), vec![0u8; 8]);
    }

    #[test]
    fn wrong_size_and_overflow_are_dropped() {
        let pool = MemoryBlockPool::new(true, 1, 8);
        pool.put_block(vec![1; 4]);
        pool.put_block(vec![1; 8]);
        assert_eq!(pool.stats().pooled_blocks, 1);
    }

    #[test]
    fn disabled_pool_just_allocates() {
        let pool = MemoryBlockPool::disabled(32);
        let block = pool.get_block();
        assert_eq!(block.len(), 32);
        pool.put_block(block);
        let stats = pool.stats();
        assert_eq!(stats.pooled_blocks, 0);
        assert_eq!((stats.hits, stats.misses), (0, 0));
    }

    #[test]
    fn clear_empties_free_list() {
        let pool = MemoryBlockPool::new(true, 3, 8);
        pool.clear();
        assert_eq!(pool.stats().pooled_blocks, 0);
    }
}
