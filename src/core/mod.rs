//! Core bookkeeping for rolling-batch.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for the paged KV cache
//! - BlockAllocator for pool ownership
//! - Request for per-request generation state
//! - RequestRegistry for owning and ordering requests

pub mod block;
pub mod block_allocator;
pub mod registry;
pub mod sequence;
