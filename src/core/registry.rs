//! Request registry.
//!
//! The registry is the only owner of [`Request`] state. Everything else
//! refers to requests by [`RequestId`]. It also keeps the three orderings
//! the scheduler needs:
//!
//! - the FIFO pending queue,
//! - the running set in admission order,
//! - submission order of every tracked request, used for output records.

use std::collections::{HashMap, VecDeque};

use crate::config::GenerationParams;
use crate::core::block_allocator::BlockAllocator;
use crate::core::sequence::{FinishReason, Request, RequestId};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct RequestRegistry {
    requests: HashMap<RequestId, Request>,
    pending: VecDeque<RequestId>,
    running: Vec<RequestId>,
    submission_order: Vec<RequestId>,
    next_id: RequestId,
    block_size: usize,
}

impl RequestRegistry {
    pub fn new(block_size: usize) -> Self {
        Self {
            requests: HashMap::new(),
            pending: VecDeque::new(),
            running: Vec::new(),
            submission_order: Vec::new(),
            next_id: 1,
            block_size,
        }
    }

    /// Register a new pending request at the back of the queue.
    pub fn insert(&mut self, prompt_token_ids: Vec<u32>, params: GenerationParams) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;

        self.requests
            .insert(id, Request::new(id, prompt_token_ids, params, self.block_size));
        self.pending.push_back(id);
        self.submission_order.push(id);
        id
    }

    /// Look up a tracked request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrCompletedRequest`] if the id is not tracked.
    pub fn get(&self, id: RequestId) -> Result<&Request> {
        self.requests
            .get(&id)
            .ok_or(Error::UnknownOrCompletedRequest(id))
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut Request> {
        self.requests
            .get_mut(&id)
            .ok_or(Error::UnknownOrCompletedRequest(id))
    }

    /// Pending ids, oldest first.
    pub fn pending_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.pending.iter().copied()
    }

    /// Running ids in admission order.
    pub fn running_ids(&self) -> &[RequestId] {
        &self.running
    }

    /// Tracked ids in submission order.
    pub fn submission_order(&self) -> &[RequestId] {
        &self.submission_order
    }

    /// Move a pending request into the running set as Prefilling.
    pub fn admit(&mut self, id: RequestId) -> Result<()> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::UnknownOrCompletedRequest(id))?;
        request.set_prefilling()?;
        self.pending.retain(|&pending| pending != id);
        self.running.push(id);
        Ok(())
    }

    /// Preempt a running request: release its blocks and put it back at the
    /// head of the pending queue.
    pub fn preempt(&mut self, id: RequestId, allocator: &mut BlockAllocator) -> Result<()> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::UnknownOrCompletedRequest(id))?;
        request.set_preempted()?;
        allocator.release(id);
        self.running.retain(|&running| running != id);
        self.pending.push_front(id);
        Ok(())
    }

    /// Move a request to its final state and free its blocks in one step.
    ///
    /// The request stays tracked until [`remove`](Self::remove) so its final
    /// output can be delivered.
    pub fn retire(
        &mut self,
        id: RequestId,
        reason: FinishReason,
        error: Option<String>,
        allocator: &mut BlockAllocator,
    ) -> Result<()> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::UnknownOrCompletedRequest(id))?;
        request.finish(reason, error)?;
        allocator.release(id);
        self.running.retain(|&running| running != id);
        self.pending.retain(|&pending| pending != id);
        Ok(())
    }

    /// Drop a request whose final output was delivered.
    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let request = self.requests.remove(&id)?;
        self.submission_order.retain(|&tracked| tracked != id);
        self.running.retain(|&running| running != id);
        self.pending.retain(|&pending| pending != id);
        Some(request)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Number of tracked requests, including finished ones not yet delivered.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Iterate over all tracked requests.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_allocator::CacheLayout;
    use crate::core::sequence::RequestState;

    #[test]
    fn test_ids_are_monotonic() {
        let mut registry = RequestRegistry::new(16);
        let a = registry.insert(vec![1], GenerationParams::default());
        let b = registry.insert(vec![2], GenerationParams::default());

        assert!(b > a);
        assert_eq!(registry.pending_ids().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(registry.submission_order(), &[a, b]);
    }

    #[test]
    fn test_admit_and_retire() {
        let mut registry = RequestRegistry::new(16);
        let mut allocator = BlockAllocator::new(4, 16, CacheLayout::Paged);
        let id = registry.insert(vec![1, 2], GenerationParams::default());

        registry.admit(id).unwrap();
        allocator.allocate(id, 1).unwrap();
        assert_eq!(registry.running_ids(), &[id]);
        assert_eq!(registry.num_pending(), 0);

        registry
            .retire(id, FinishReason::MaxTokens, None, &mut allocator)
            .unwrap();
        assert_eq!(registry.get(id).unwrap().state(), RequestState::Completed);
        assert_eq!(registry.num_running(), 0);
        assert_eq!(allocator.num_free_blocks(), 4);

        // Still tracked until delivered
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert!(matches!(
            registry.get(id),
            Err(Error::UnknownOrCompletedRequest(_))
        ));
    }

    #[test]
    fn test_preempted_request_goes_first() {
        let mut registry = RequestRegistry::new(16);
        let mut allocator = BlockAllocator::new(4, 16, CacheLayout::Paged);
        let a = registry.insert(vec![1], GenerationParams::default());
        let b = registry.insert(vec![2], GenerationParams::default());

        registry.admit(a).unwrap();
        allocator.allocate(a, 2).unwrap();

        registry.preempt(a, &mut allocator).unwrap();

        assert_eq!(registry.pending_ids().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(allocator.num_free_blocks(), 4);
    }
}
