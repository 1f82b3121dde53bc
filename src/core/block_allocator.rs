//! Cache block allocator.
//!
//! The allocator owns the fixed pool of KV cache blocks and records which
//! request holds which blocks, like an operating system handing out
//! physical pages to processes.
//!
//! ## Layouts
//!
//! - **Paged**: blocks come from a free list one at a time, so a request's
//!   blocks may be scattered anywhere in the pool.
//! - **Contiguous**: a request reserves a single run of adjacent blocks
//!   covering its worst-case length. Simpler for backends without paged
//!   attention kernels, at the cost of fragmentation.
//!
//! ## Example
//!
//! ```
//! use rolling_batch::core::block_allocator::{BlockAllocator, CacheLayout};
//!
//! let mut allocator = BlockAllocator::new(8, 16, CacheLayout::Paged);
//!
//! let blocks = allocator.allocate(1, 3).unwrap();
//! assert_eq!(blocks.len(), 3);
//! assert_eq!(allocator.num_free_blocks(), 5);
//!
//! assert_eq!(allocator.release(1), 3);
//! assert_eq!(allocator.release(1), 0); // idempotent
//! assert_eq!(allocator.num_free_blocks(), 8);
//! ```

use std::collections::{HashMap, VecDeque};

use crate::core::block::{Block, BlockId, DEFAULT_BLOCK_SIZE};
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Physical arrangement of a request's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayout {
    /// Blocks allocated on demand from anywhere in the pool.
    Paged,
    /// One run of adjacent blocks reserved up front.
    Contiguous,
}

impl CacheLayout {
    /// Layout selected by the `paged_attention` option.
    pub fn from_paged_attention(paged_attention: bool) -> Self {
        if paged_attention {
            Self::Paged
        } else {
            Self::Contiguous
        }
    }
}

/// Manages allocation and release of KV cache blocks.
///
/// Every mutation goes through [`allocate`](Self::allocate) and
/// [`release`](Self::release); a block is never visible as free while a
/// request owns it.
#[derive(Debug)]
pub struct BlockAllocator {
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs.
    free_list: VecDeque<BlockId>,
    /// Blocks held by each request, in logical order.
    owned: HashMap<RequestId, Vec<BlockId>>,
    /// Number of tokens per block.
    block_size: usize,
    layout: CacheLayout,
}

impl BlockAllocator {
    /// Create an allocator over `num_blocks` blocks of `block_size` tokens.
    pub fn new(num_blocks: usize, block_size: usize, layout: CacheLayout) -> Self {
        Self {
            blocks: (0..num_blocks).map(|id| Block::new(id, block_size)).collect(),
            free_list: (0..num_blocks).collect(),
            owned: HashMap::new(),
            block_size,
            layout,
        }
    }

    /// Create a paged allocator with the default block size.
    pub fn with_default_block_size(num_blocks: usize) -> Self {
        Self::new(num_blocks, DEFAULT_BLOCK_SIZE, CacheLayout::Paged)
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the layout.
    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Get the number of blocks held by requests.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Number of requests holding at least one block.
    pub fn num_owners(&self) -> usize {
        self.owned.len()
    }

    /// Check whether `num_blocks` more blocks can be handed out.
    ///
    /// Under the contiguous layout this requires a free run of that length.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        match self.layout {
            CacheLayout::Paged => self.free_list.len() >= num_blocks,
            CacheLayout::Contiguous => {
                num_blocks == 0 || self.find_free_run(num_blocks).is_some()
            }
        }
    }

    /// Allocate `num_blocks` blocks to `request_id`.
    ///
    /// All-or-nothing: on failure the pool is untouched. New blocks are
    /// appended to the request's existing block list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfCapacity`] if the blocks are not available.
    pub fn allocate(&mut self, request_id: RequestId, num_blocks: usize) -> Result<Vec<BlockId>> {
        if num_blocks == 0 {
            return Ok(Vec::new());
        }

        let block_ids: Vec<BlockId> = match self.layout {
            CacheLayout::Paged => {
                if self.free_list.len() < num_blocks {
                    return Err(self.out_of_capacity(num_blocks));
                }
                self.free_list.drain(..num_blocks).collect()
            }
            CacheLayout::Contiguous => {
                let start = self
                    .find_free_run(num_blocks)
                    .ok_or_else(|| self.out_of_capacity(num_blocks))?;
                let run = start..start + num_blocks;
                self.free_list.retain(|id| !run.contains(id));
                run.collect()
            }
        };

        for &block_id in &block_ids {
            self.blocks[block_id].assign(request_id)?;
        }
        self.owned
            .entry(request_id)
            .or_default()
            .extend_from_slice(&block_ids);

        Ok(block_ids)
    }

    /// Return every block owned by `request_id` to the free pool.
    ///
    /// Idempotent: releasing a request that holds nothing is a no-op.
    ///
    /// # Returns
    ///
    /// Number of blocks released.
    pub fn release(&mut self, request_id: RequestId) -> usize {
        let Some(block_ids) = self.owned.remove(&request_id) else {
            return 0;
        };

        for &block_id in &block_ids {
            self.blocks[block_id].clear_owner();
            self.free_list.push_back(block_id);
        }
        block_ids.len()
    }

    /// Blocks held by `request_id`, in logical order.
    pub fn blocks_of(&self, request_id: RequestId) -> &[BlockId] {
        self.owned.get(&request_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Request currently holding `block_id`.
    pub fn owner_of(&self, block_id: BlockId) -> Option<RequestId> {
        self.blocks.get(block_id).and_then(Block::owner)
    }

    /// Get a reference to a block.
    pub fn get_block(&self, block_id: BlockId) -> Option<&Block> {
        self.blocks.get(block_id)
    }

    /// Reset the allocator to its initial state, dropping every ownership.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.clear_owner();
        }
        self.owned.clear();
        self.free_list.clear();
        self.free_list.extend(0..self.blocks.len());
    }

    /// First-fit search for `len` adjacent free blocks.
    fn find_free_run(&self, len: usize) -> Option<BlockId> {
        let mut run_start = 0;
        let mut run_len = 0;
        for block in &self.blocks {
            if block.is_free() {
                if run_len == 0 {
                    run_start = block.block_id();
                }
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    fn out_of_capacity(&self, requested: usize) -> Error {
        Error::OutOfCapacity {
            requested,
            available: self.free_list.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_creation() {
        let allocator = BlockAllocator::new(100, 16, CacheLayout::Paged);
        assert_eq!(allocator.num_blocks(), 100);
        assert_eq!(allocator.block_size(), 16);
        assert_eq!(allocator.num_free_blocks(), 100);
        assert_eq!(allocator.num_used_blocks(), 0);
    }

    #[test]
    fn test_allocate_records_owner() {
        let mut allocator = BlockAllocator::new(10, 16, CacheLayout::Paged);

        let blocks = allocator.allocate(3, 2).unwrap();
        assert_eq!(allocator.blocks_of(3), blocks.as_slice());
        for &block in &blocks {
            assert_eq!(allocator.owner_of(block), Some(3));
        }

        // Extending appends in logical order
        let more = allocator.allocate(3, 1).unwrap();
        assert_eq!(allocator.blocks_of(3).len(), 3);
        assert_eq!(allocator.blocks_of(3)[2], more[0]);
    }

    #[test]
    fn test_allocation_is_all_or_nothing() {
        let mut allocator = BlockAllocator::new(4, 16, CacheLayout::Paged);
        allocator.allocate(1, 3).unwrap();

        let err = allocator.allocate(2, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfCapacity {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(allocator.num_free_blocks(), 1);
        assert!(allocator.blocks_of(2).is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut allocator = BlockAllocator::new(10, 16, CacheLayout::Paged);
        allocator.allocate(1, 4).unwrap();
        allocator.allocate(2, 3).unwrap();

        assert_eq!(allocator.release(1), 4);
        assert_eq!(allocator.release(1), 0);

        // Request 2 is untouched
        assert_eq!(allocator.blocks_of(2).len(), 3);
        assert_eq!(allocator.num_used_blocks(), 3);
    }

    #[test]
    fn test_zero_block_allocation() {
        let mut allocator = BlockAllocator::new(1, 16, CacheLayout::Paged);
        assert!(allocator.allocate(1, 0).unwrap().is_empty());
        assert_eq!(allocator.num_owners(), 0);
    }

    #[test]
    fn test_contiguous_run() {
        let mut allocator = BlockAllocator::new(6, 16, CacheLayout::Contiguous);

        assert_eq!(allocator.allocate(1, 2).unwrap(), vec![0, 1]);
        assert_eq!(allocator.allocate(2, 2).unwrap(), vec![2, 3]);
        assert_eq!(allocator.allocate(3, 2).unwrap(), vec![4, 5]);

        allocator.release(1);
        allocator.release(3);

        // Four blocks free but no run of three
        assert_eq!(allocator.num_free_blocks(), 4);
        assert!(!allocator.can_allocate(3));
        assert!(allocator.allocate(4, 3).is_err());

        allocator.release(2);
        assert_eq!(allocator.allocate(4, 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reset() {
        let mut allocator = BlockAllocator::new(10, 16, CacheLayout::Paged);
        allocator.allocate(1, 5).unwrap();

        allocator.reset();

        assert_eq!(allocator.num_free_blocks(), 10);
        assert_eq!(allocator.num_owners(), 0);
        assert_eq!(allocator.owner_of(0), None);
    }
}
