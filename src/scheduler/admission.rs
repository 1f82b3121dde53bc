//! Admission control for continuous batching.
//!
//! Every step the controller first makes room for the requests that are
//! already running, then admits pending requests in arrival order.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐      slots, prefill budget,       ┌─────────────┐
//!   │ Pending │ ────────── free blocks ─────────► │   Running   │
//!   │  (FIFO) │                                   │ (prefill +  │
//!   └─────────┘                                   │   decode)   │
//!        ▲                                        └─────────────┘
//!        │         preempt newest running               │
//!        └────────── (cache exhausted) ─────────────────┘
//! ```
//!
//! Requests that can never run (prompt larger than the prefill budget, or
//! prompt plus `max_new_tokens` larger than the whole cache) are rejected
//! before they start. A preempted request whose recompute outgrew the
//! prefill budget is retired with the output it already delivered.
//! Requests asking for zero new tokens are completed without touching the
//! cache or the backend.

use tracing::debug;

use crate::core::block::compute_num_blocks;
use crate::core::block_allocator::{BlockAllocator, CacheLayout};
use crate::core::registry::RequestRegistry;
use crate::core::sequence::{FinishReason, Request, RequestId, RequestState};
use crate::error::{Error, Result};

/// Output of a scheduling step.
#[derive(Debug, Default)]
pub struct SchedulerOutputs {
    /// Requests admitted this step; their prompt is prefilled.
    pub prefill_requests: Vec<RequestId>,
    /// Requests generating one token this step.
    pub decode_requests: Vec<RequestId>,
    /// Running requests sent back to the queue to free cache blocks.
    pub preempted_requests: Vec<RequestId>,
    /// Requests failed at admission.
    pub rejected_requests: Vec<RequestId>,
    /// Requests completed without execution (`max_new_tokens == 0`).
    pub completed_requests: Vec<RequestId>,
    /// Tokens fed by this step's prefills, recomputed output included.
    pub num_prefill_tokens: usize,
}

impl SchedulerOutputs {
    /// Check if there is anything to execute.
    pub fn is_empty(&self) -> bool {
        self.prefill_requests.is_empty() && self.decode_requests.is_empty()
    }

    /// Number of requests executed this step.
    pub fn num_requests(&self) -> usize {
        self.prefill_requests.len() + self.decode_requests.len()
    }
}

/// Selects which requests run each step.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    /// Cap on concurrently running requests.
    max_batch_size: usize,
    /// Prefill tokens admitted per step.
    max_prefill_tokens: usize,
}

impl AdmissionController {
    pub fn new(max_batch_size: usize, max_prefill_tokens: usize) -> Self {
        Self {
            max_batch_size,
            max_prefill_tokens,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_prefill_tokens(&self) -> usize {
        self.max_prefill_tokens
    }

    /// Schedule the next step.
    ///
    /// Mutates the registry and the allocator together: every admitted
    /// request holds its initial blocks on return, every rejected or
    /// preempted request holds none.
    pub fn schedule(
        &self,
        registry: &mut RequestRegistry,
        allocator: &mut BlockAllocator,
    ) -> Result<SchedulerOutputs> {
        let mut outputs = SchedulerOutputs::default();

        self.reserve_running(registry, allocator, &mut outputs)?;
        self.settle_trivial(registry, allocator, &mut outputs)?;
        self.admit_pending(registry, allocator, &mut outputs)?;

        debug!(
            prefill = outputs.prefill_requests.len(),
            decode = outputs.decode_requests.len(),
            preempted = outputs.preempted_requests.len(),
            rejected = outputs.rejected_requests.len(),
            prefill_tokens = outputs.num_prefill_tokens,
            free_blocks = allocator.num_free_blocks(),
            "scheduled step"
        );

        Ok(outputs)
    }

    /// Give every running request room for the token it feeds this step.
    ///
    /// When the pool is exhausted the most recently admitted request is
    /// preempted, repeatedly, until the older request fits.
    fn reserve_running(
        &self,
        registry: &mut RequestRegistry,
        allocator: &mut BlockAllocator,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let running: Vec<RequestId> = registry.running_ids().to_vec();

        for id in running {
            if registry.get(id)?.state() != RequestState::Decoding {
                continue;
            }

            loop {
                let request = registry.get(id)?;
                let needed = blocks_needed(request, allocator);
                if needed == 0 {
                    outputs.decode_requests.push(id);
                    break;
                }

                match allocator.allocate(id, needed) {
                    Ok(block_ids) => {
                        registry.get_mut(id)?.block_table_mut().extend(block_ids);
                        outputs.decode_requests.push(id);
                        break;
                    }
                    Err(Error::OutOfCapacity { .. }) => {
                        let victim = match registry.running_ids().last() {
                            Some(&victim) => victim,
                            None => break,
                        };
                        debug!(request_id = victim, for_request = id, "preempting request");
                        registry.preempt(victim, allocator)?;
                        outputs.decode_requests.retain(|&decode| decode != victim);
                        outputs.preempted_requests.push(victim);
                        if victim == id {
                            break;
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }

    /// Complete zero-token requests and retire requests that can never fit.
    fn settle_trivial(
        &self,
        registry: &mut RequestRegistry,
        allocator: &mut BlockAllocator,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let pending: Vec<RequestId> = registry.pending_ids().collect();

        for id in pending {
            let request = registry.get(id)?;

            if request.reached_max_tokens() {
                registry.retire(id, FinishReason::MaxTokens, None, allocator)?;
                outputs.completed_requests.push(id);
                continue;
            }

            if let Some((reason, err)) = self.rejection(request, allocator) {
                debug!(request_id = id, ?reason, error = %err, "rejecting request");
                registry.retire(id, reason, Some(err.to_string()), allocator)?;
                outputs.rejected_requests.push(id);
            }
        }

        Ok(())
    }

    /// Why a pending request can never be admitted, if so.
    fn rejection(
        &self,
        request: &Request,
        allocator: &BlockAllocator,
    ) -> Option<(FinishReason, Error)> {
        let prefill_tokens = request.num_tokens_to_feed();

        // Already started: the footprint was checked at first admission.
        if request.output_len() > 0 {
            return (prefill_tokens > self.max_prefill_tokens).then(|| {
                (
                    FinishReason::CapacityExceeded,
                    Error::RecomputeTooLarge {
                        tokens: prefill_tokens,
                        budget: self.max_prefill_tokens,
                    },
                )
            });
        }

        if prefill_tokens > self.max_prefill_tokens {
            return Some((
                FinishReason::PromptTooLarge,
                Error::PromptTooLarge {
                    prompt_tokens: prefill_tokens,
                    budget: self.max_prefill_tokens,
                },
            ));
        }

        let required_tokens = request.prompt_len() + request.params().max_new_tokens;
        if compute_num_blocks(required_tokens, allocator.block_size()) > allocator.num_blocks() {
            return Some((
                FinishReason::PromptTooLarge,
                Error::ExceedsCachePool {
                    required_tokens,
                    pool_tokens: allocator.num_blocks() * allocator.block_size(),
                },
            ));
        }

        None
    }

    /// Admit pending requests in FIFO order.
    ///
    /// The first request that does not fit stops the scan so later, smaller
    /// requests cannot starve it.
    fn admit_pending(
        &self,
        registry: &mut RequestRegistry,
        allocator: &mut BlockAllocator,
        outputs: &mut SchedulerOutputs,
    ) -> Result<()> {
        let pending: Vec<RequestId> = registry.pending_ids().collect();

        // Nothing new joins while running requests are being pushed out.
        if !outputs.preempted_requests.is_empty() {
            return Ok(());
        }

        for id in pending {
            if registry.num_running() >= self.max_batch_size {
                break;
            }

            let request = registry.get(id)?;
            let prefill_tokens = request.num_tokens_to_feed();
            if outputs.num_prefill_tokens + prefill_tokens > self.max_prefill_tokens {
                break;
            }

            let num_blocks = initial_blocks(request, allocator);
            let block_ids = match allocator.allocate(id, num_blocks) {
                Ok(block_ids) => block_ids,
                Err(err @ Error::OutOfCapacity { .. }) => {
                    debug!(request_id = id, error = %err, "request stays pending");
                    break;
                }
                Err(err) => return Err(err),
            };

            registry.admit(id)?;
            registry.get_mut(id)?.block_table_mut().extend(block_ids);
            outputs.prefill_requests.push(id);
            outputs.num_prefill_tokens += prefill_tokens;
        }

        Ok(())
    }
}

/// Blocks a pending request needs before its first step.
fn initial_blocks(request: &Request, allocator: &BlockAllocator) -> usize {
    let tokens = match allocator.layout() {
        CacheLayout::Paged => request.tokens_after_step(),
        CacheLayout::Contiguous => request.prompt_len() + request.params().max_new_tokens,
    };
    compute_num_blocks(tokens, allocator.block_size())
}

/// Additional blocks a running request needs for its next step.
fn blocks_needed(request: &Request, allocator: &BlockAllocator) -> usize {
    let required = compute_num_blocks(request.tokens_after_step(), allocator.block_size());
    required.saturating_sub(request.block_table().num_blocks())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationParams;

    fn setup(num_blocks: usize) -> (RequestRegistry, BlockAllocator) {
        (
            RequestRegistry::new(4),
            BlockAllocator::new(num_blocks, 4, CacheLayout::Paged),
        )
    }

    #[test]
    fn test_admits_in_arrival_order() {
        let (mut registry, mut allocator) = setup(100);
        let controller = AdmissionController::new(2, 100);
        let a = registry.insert(vec![1; 4], GenerationParams::greedy(8));
        let b = registry.insert(vec![1; 4], GenerationParams::greedy(8));
        let c = registry.insert(vec![1; 4], GenerationParams::greedy(8));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.prefill_requests, vec![a, b]);
        assert_eq!(registry.pending_ids().collect::<Vec<_>>(), vec![c]);
        assert_eq!(allocator.blocks_of(a).len(), 1);
    }

    #[test]
    fn test_prefill_budget_stops_scan() {
        let (mut registry, mut allocator) = setup(100);
        let controller = AdmissionController::new(8, 10);
        let a = registry.insert(vec![1; 6], GenerationParams::greedy(8));
        let b = registry.insert(vec![1; 6], GenerationParams::greedy(8));
        // Would fit the budget but must not overtake b
        registry.insert(vec![1; 2], GenerationParams::greedy(8));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.prefill_requests, vec![a]);
        assert_eq!(outputs.num_prefill_tokens, 6);
        assert_eq!(registry.pending_ids().next(), Some(b));
    }

    #[test]
    fn test_prompt_too_large_rejected() {
        let (mut registry, mut allocator) = setup(100);
        let controller = AdmissionController::new(8, 10);
        let big = registry.insert(vec![1; 11], GenerationParams::greedy(8));
        let small = registry.insert(vec![1; 3], GenerationParams::greedy(8));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.rejected_requests, vec![big]);
        assert_eq!(outputs.prefill_requests, vec![small]);
        let rejected = registry.get(big).unwrap();
        assert_eq!(rejected.state(), RequestState::Failed);
        assert_eq!(rejected.finish_reason(), Some(FinishReason::PromptTooLarge));
        assert!(allocator.blocks_of(big).is_empty());
    }

    #[test]
    fn test_zero_tokens_completes_without_blocks() {
        let (mut registry, mut allocator) = setup(100);
        let controller = AdmissionController::new(8, 100);
        let id = registry.insert(vec![1; 4], GenerationParams::greedy(0));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert!(outputs.is_empty());
        assert_eq!(outputs.completed_requests, vec![id]);
        assert_eq!(registry.get(id).unwrap().state(), RequestState::Completed);
        assert_eq!(allocator.num_used_blocks(), 0);
    }

    #[test]
    fn test_out_of_blocks_stays_pending() {
        let (mut registry, mut allocator) = setup(3);
        let controller = AdmissionController::new(8, 100);
        let a = registry.insert(vec![1; 8], GenerationParams::greedy(4));
        let b = registry.insert(vec![1; 8], GenerationParams::greedy(4));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.prefill_requests, vec![a]);
        assert_eq!(registry.get(b).unwrap().state(), RequestState::Pending);
        assert_eq!(allocator.num_free_blocks(), 1);
    }

    #[test]
    fn test_decode_growth_preempts_newest() {
        let (mut registry, mut allocator) = setup(2);
        let controller = AdmissionController::new(8, 100);
        let a = registry.insert(vec![1; 4], GenerationParams::greedy(4));
        let b = registry.insert(vec![1; 4], GenerationParams::greedy(4));
        controller.schedule(&mut registry, &mut allocator).unwrap();

        // Both prefilled and produced a token: each now needs a second block
        for id in [a, b] {
            let request = registry.get_mut(id).unwrap();
            request.append_token(9).unwrap();
            request.set_decoding().unwrap();
        }

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.decode_requests, vec![a]);
        assert_eq!(outputs.preempted_requests, vec![b]);
        assert_eq!(allocator.blocks_of(a).len(), 2);
        assert!(allocator.blocks_of(b).is_empty());
        assert_eq!(registry.get(b).unwrap().state(), RequestState::Pending);
        assert_eq!(registry.pending_ids().next(), Some(b));
    }

    #[test]
    fn test_request_outgrowing_pool_rejected_before_start() {
        let (mut registry, mut allocator) = setup(2);
        let controller = AdmissionController::new(8, 100);
        // Prompt fits one block but 4 + 10 tokens need 4 of the 2 blocks
        let id = registry.insert(vec![1; 4], GenerationParams::greedy(10));

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();

        assert_eq!(outputs.rejected_requests, vec![id]);
        let request = registry.get(id).unwrap();
        assert_eq!(request.output_len(), 0);
        assert_eq!(request.finish_reason(), Some(FinishReason::PromptTooLarge));
        assert_eq!(
            request.error(),
            Some("request needs 14 cache slots, the pool holds 8")
        );
    }

    #[test]
    fn test_recompute_counts_against_prefill_budget() {
        let (mut registry, mut allocator) = setup(100);
        let controller = AdmissionController::new(8, 6);
        let a = registry.insert(vec![1; 4], GenerationParams::greedy(8));
        controller.schedule(&mut registry, &mut allocator).unwrap();
        for token in 0..2 {
            registry.get_mut(a).unwrap().append_token(token).unwrap();
        }
        registry.preempt(a, &mut allocator).unwrap();

        // Prompt 4 + output 2 fills the budget exactly
        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();
        assert_eq!(outputs.prefill_requests, vec![a]);
        assert_eq!(outputs.num_prefill_tokens, 6);

        registry.get_mut(a).unwrap().append_token(2).unwrap();
        registry.preempt(a, &mut allocator).unwrap();

        let outputs = controller.schedule(&mut registry, &mut allocator).unwrap();
        assert_eq!(outputs.rejected_requests, vec![a]);
        let request = registry.get(a).unwrap();
        assert_eq!(request.finish_reason(), Some(FinishReason::CapacityExceeded));
        assert_eq!(request.output_len(), 3);
        assert!(request.error().unwrap().contains("exceeds the prefill budget of 6"));
        assert_eq!(allocator.num_used_blocks(), 0);
    }
}
