//! Cache block abstractions.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. Because every block has the
//! same capacity, freeing and reusing them never fragments the pool.

use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Identifier of a physical block in the pool.
pub type BlockId = usize;

/// A physical block of KV cache memory.
///
/// Each block stores KV states for `block_size` tokens and belongs to at
/// most one request at a time.
#[derive(Debug, Clone)]
pub struct Block {
    /// Unique identifier for this physical block.
    block_id: BlockId,
    /// Number of tokens this block can hold.
    block_size: usize,
    /// Request currently holding the block, `None` when free.
    owner: Option<RequestId>,
}

impl Block {
    /// Create a new, free block.
    pub fn new(block_id: BlockId, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            owner: None,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Request owning this block.
    pub fn owner(&self) -> Option<RequestId> {
        self.owner
    }

    /// Check if the block is free.
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    /// Hand the block to `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the block is already owned.
    pub fn assign(&mut self, request_id: RequestId) -> Result<()> {
        if self.owner.is_some() {
            return Err(Error::InvalidStateTransition {
                from: "Owned",
                to: "Owned",
            });
        }
        self.owner = Some(request_id);
        Ok(())
    }

    /// Return the block to the free state, yielding the previous owner.
    pub fn clear_owner(&mut self) -> Option<RequestId> {
        self.owner.take()
    }
}

/// Maps a request's logical positions to physical block IDs.
///
/// Think of this like a page table in virtual memory:
/// - Logical block index: Position in the sequence (0, 1, 2, ...)
/// - Physical block ID: Actual block in the global cache pool
///
/// Token at position `p` is stored in block `block_ids[p / block_size]`
/// at slot `p % block_size`.
///
/// # Example
///
/// ```
/// use rolling_batch::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
///
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// assert_eq!(table.capacity(), 32);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<BlockId>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the logical index is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or_else(|| {
                Error::Config(format!(
                    "logical block {logical_block_idx} out of bounds ({} allocated)",
                    self.block_ids.len()
                ))
            })
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    /// Add several physical blocks in order.
    pub fn extend(&mut self, block_ids: impl IntoIterator<Item = BlockId>) {
        self.block_ids.extend(block_ids);
    }

    /// Number of blocks allocated.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of tokens the allocated blocks can hold.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs.
    pub fn get_physical_block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Global slot indices for tokens `start..end`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`. Positions
    /// beyond the allocated capacity are not mapped.
    pub fn slot_mapping(&self, start: usize, end: usize) -> Vec<usize> {
        (start..end)
            .filter_map(|pos| {
                self.block_ids
                    .get(pos / self.block_size)
                    .map(|&block| block * self.block_size + pos % self.block_size)
            })
            .collect()
    }

    /// Clear all blocks from the table.
    pub fn clear(&mut self) {
        self.block_ids.clear();
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// ```
/// use rolling_batch::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
