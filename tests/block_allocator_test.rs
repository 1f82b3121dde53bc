//! Integration tests for BlockAllocator.

use rolling_batch::core::block_allocator::{BlockAllocator, CacheLayout};
use rolling_batch::Error;

#[test]
fn test_allocator_creation() {
    let allocator = BlockAllocator::new(100, 16, CacheLayout::Paged);

    assert_eq!(allocator.num_blocks(), 100);
    assert_eq!(allocator.num_free_blocks(), 100);
    assert_eq!(allocator.num_used_blocks(), 0);
    assert_eq!(allocator.block_size(), 16);
    assert_eq!(allocator.layout(), CacheLayout::Paged);
}

#[test]
fn test_allocate_and_release() {
    let mut allocator = BlockAllocator::with_default_block_size(10);

    let blocks = allocator.allocate(1, 3).unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(allocator.num_free_blocks(), 7);
    for &block in &blocks {
        assert_eq!(allocator.owner_of(block), Some(1));
    }

    assert_eq!(allocator.release(1), 3);
    assert_eq!(allocator.num_free_blocks(), 10);
    for &block in &blocks {
        assert_eq!(allocator.owner_of(block), None);
    }
}

#[test]
fn test_allocation_appends_to_request() {
    let mut allocator = BlockAllocator::with_default_block_size(10);

    let first = allocator.allocate(1, 2).unwrap();
    let second = allocator.allocate(1, 1).unwrap();

    let mut expected = first.clone();
    expected.extend(&second);
    assert_eq!(allocator.blocks_of(1), expected.as_slice());
    assert_eq!(allocator.num_owners(), 1);
}

#[test]
fn test_out_of_capacity_is_all_or_nothing() {
    let mut allocator = BlockAllocator::with_default_block_size(4);
    allocator.allocate(1, 3).unwrap();

    let err = allocator.allocate(2, 2).unwrap_err();

    assert!(matches!(
        err,
        Error::OutOfCapacity {
            requested: 2,
            available: 1
        }
    ));
    assert!(err.is_transient());
    assert_eq!(allocator.num_free_blocks(), 1);
    assert!(allocator.blocks_of(2).is_empty());
}

#[test]
fn test_release_is_idempotent() {
    let mut allocator = BlockAllocator::with_default_block_size(4);
    allocator.allocate(1, 2).unwrap();
    allocator.allocate(2, 2).unwrap();

    assert_eq!(allocator.release(1), 2);
    assert_eq!(allocator.release(1), 0);
    assert_eq!(allocator.release(99), 0);

    assert_eq!(allocator.num_free_blocks(), 2);
    assert_eq!(allocator.blocks_of(2).len(), 2);
}

#[test]
fn test_zero_block_allocation() {
    let mut allocator = BlockAllocator::with_default_block_size(1);

    assert!(allocator.allocate(1, 0).unwrap().is_empty());
    assert_eq!(allocator.num_owners(), 0);
}

#[test]
fn test_contiguous_first_fit() {
    let mut allocator = BlockAllocator::new(8, 4, CacheLayout::Contiguous);
    assert_eq!(allocator.allocate(1, 3).unwrap(), vec![0, 1, 2]);
    assert_eq!(allocator.allocate(2, 2).unwrap(), vec![3, 4]);
    allocator.release(1);

    // Hole of 3 at the front, run of 3 at the back
    assert!(allocator.can_allocate(3));
    assert!(!allocator.can_allocate(4));
    assert_eq!(allocator.allocate(3, 2).unwrap(), vec![0, 1]);
    assert_eq!(allocator.allocate(4, 3).unwrap(), vec![5, 6, 7]);
    assert!(matches!(
        allocator.allocate(5, 2),
        Err(Error::OutOfCapacity { .. })
    ));
}

#[test]
fn test_can_allocate() {
    let mut allocator = BlockAllocator::with_default_block_size(5);

    assert!(allocator.can_allocate(5));
    assert!(!allocator.can_allocate(6));
    allocator.allocate(1, 3).unwrap();
    assert!(allocator.can_allocate(2));
    assert!(!allocator.can_allocate(3));
}

#[test]
fn test_reset() {
    let mut allocator = BlockAllocator::with_default_block_size(6);
    allocator.allocate(1, 2).unwrap();
    allocator.allocate(2, 3).unwrap();

    allocator.reset();

    assert_eq!(allocator.num_free_blocks(), 6);
    assert_eq!(allocator.num_owners(), 0);
    assert!(allocator.get_block(0).unwrap().is_free());
}
