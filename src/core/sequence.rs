//! Per-request generation state.
//!
//! A [`Request`] tracks a single generation request: its prompt, the tokens
//! generated so far, its lifecycle state, its KV cache blocks and how much
//! of its output has already been delivered to the caller.
//!
//! ## Lifecycle
//!
//! ```text
//!   Pending ──admit──► Prefilling ──first step──► Decoding ──stop──► Completed
//!      ▲                   │                         │
//!      └─────preempt───────┴─────────────────────────┘
//!
//!   any non-final state ──backend error / reject / cancel──► Failed
//! ```

use std::time::Instant;

use serde::Serialize;

use crate::config::GenerationParams;
use crate::core::block::BlockTable;
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting in the admission queue.
    Pending,
    /// Admitted; its prompt is processed by the current step.
    Prefilling,
    /// Generating one token per step.
    Decoding,
    /// A stop condition was met.
    Completed,
    /// Rejected, cancelled, or lost to a backend failure.
    Failed,
}

impl RequestState {
    /// Check if the request is part of the active batch.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Prefilling | Self::Decoding)
    }

    /// Check if the request reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Prefilling => "Prefilling",
            Self::Decoding => "Decoding",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

/// Reason a request reached a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// `max_new_tokens` reached.
    MaxTokens,
    /// A stop string matched the decoded output.
    StopString,
    /// Cancelled by the caller.
    Cancelled,
    /// Rejected before starting: the prompt exceeds the prefill budget or
    /// the full request can never fit the cache pool.
    PromptTooLarge,
    /// Preempted, and its recompute no longer fits the prefill budget.
    CapacityExceeded,
    /// The backend failed the step this request was part of.
    BackendFailure,
    /// The request could not be accepted (bad parameters, empty prompt).
    InvalidRequest,
}

impl FinishReason {
    /// Whether this reason puts the request in [`RequestState::Failed`].
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::PromptTooLarge
                | Self::CapacityExceeded
                | Self::BackendFailure
                | Self::InvalidRequest
        )
    }
}

/// A single generation request.
///
/// # Example
///
/// ```
/// use rolling_batch::config::GenerationParams;
/// use rolling_batch::core::sequence::{Request, RequestState};
///
/// let mut request = Request::new(1, vec![1, 2, 3, 4], GenerationParams::greedy(8), 16);
/// assert_eq!(request.state(), RequestState::Pending);
/// assert_eq!(request.prompt_len(), 4);
///
/// request.set_prefilling().unwrap();
/// request.append_token(5).unwrap();
/// assert_eq!(request.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    params: GenerationParams,
    state: RequestState,
    /// Block table for KV cache mapping.
    block_table: BlockTable,
    /// Tokens whose keys/values are already in the cache.
    num_computed_tokens: usize,
    /// Output tokens already handed to the caller.
    num_emitted_tokens: usize,
    /// Start of the output window whose text is already delivered.
    prefix_offset: usize,
    /// End of that window; tokens past it have no delivered text yet.
    read_offset: usize,
    finish_reason: Option<FinishReason>,
    error: Option<String>,
    arrival_time: Instant,
    /// Times this request was preempted back to the queue.
    num_preemptions: usize,
}

impl Request {
    /// Create a new pending request.
    pub fn new(
        id: RequestId,
        prompt_token_ids: Vec<u32>,
        params: GenerationParams,
        block_size: usize,
    ) -> Self {
        Self {
            id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            params,
            state: RequestState::Pending,
            block_table: BlockTable::new(block_size),
            num_computed_tokens: 0,
            num_emitted_tokens: 0,
            prefix_offset: 0,
            read_offset: 0,
            finish_reason: None,
            error: None,
            arrival_time: Instant::now(),
            num_preemptions: 0,
        }
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Failure detail, if the request failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn num_preemptions(&self) -> usize {
        self.num_preemptions
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Prompt plus generated tokens.
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Tokens the next step feeds to the backend.
    ///
    /// The whole prompt (plus any output being recomputed after preemption)
    /// for a prefill, the last sampled token for a decode.
    pub fn tokens_to_feed(&self) -> Vec<u32> {
        let start = self.num_computed_tokens;
        if start < self.prompt_len() {
            let mut tokens = self.prompt_token_ids[start..].to_vec();
            tokens.extend_from_slice(&self.output_token_ids);
            tokens
        } else {
            self.output_token_ids[start - self.prompt_len()..].to_vec()
        }
    }

    /// Length of [`tokens_to_feed`](Self::tokens_to_feed).
    pub fn num_tokens_to_feed(&self) -> usize {
        self.total_len() - self.num_computed_tokens
    }

    /// Cache slots needed after the next step: every token fed so far.
    pub fn tokens_after_step(&self) -> usize {
        self.total_len()
    }

    /// Check whether the generation limit has been reached.
    pub fn reached_max_tokens(&self) -> bool {
        self.output_len() >= self.params.max_new_tokens
    }

    // ========== Token operations ==========

    /// Append a generated token and mark the fed tokens as cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] unless the request is running.
    pub fn append_token(&mut self, token_id: u32) -> Result<()> {
        if !self.state.is_running() {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "Decoding",
            });
        }
        self.num_computed_tokens = self.total_len();
        self.output_token_ids.push(token_id);
        Ok(())
    }

    /// Output tokens not yet delivered; advances the delivery cursor.
    pub fn take_token_delta(&mut self) -> Vec<u32> {
        let delta = self.output_token_ids[self.num_emitted_tokens..].to_vec();
        self.num_emitted_tokens = self.output_token_ids.len();
        delta
    }

    /// Output token window `(prefix_offset, read_offset)` for incremental
    /// detokenization.
    ///
    /// Text for `output[prefix_offset..read_offset]` was delivered; the next
    /// delta is what `output[prefix_offset..]` decodes to beyond it.
    pub fn text_offsets(&self) -> (usize, usize) {
        (self.prefix_offset, self.read_offset)
    }

    /// Slide the text window after a delta was delivered.
    pub fn advance_text_offsets(&mut self, prefix_offset: usize, read_offset: usize) {
        self.prefix_offset = prefix_offset;
        self.read_offset = read_offset;
    }

    // ========== State transitions ==========

    /// Pending → Prefilling.
    pub fn set_prefilling(&mut self) -> Result<()> {
        self.transition(RequestState::Pending, RequestState::Prefilling)
    }

    /// Prefilling → Decoding, after the first successful step.
    pub fn set_decoding(&mut self) -> Result<()> {
        self.transition(RequestState::Prefilling, RequestState::Decoding)
    }

    /// Running → Pending after the request lost its blocks.
    ///
    /// Cached state is dropped; the next prefill recomputes prompt and
    /// output. Generated tokens and delivery cursors are kept.
    pub fn set_preempted(&mut self) -> Result<()> {
        if !self.state.is_running() {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: "Pending",
            });
        }
        self.state = RequestState::Pending;
        self.num_computed_tokens = 0;
        self.block_table.clear();
        self.num_preemptions += 1;
        Ok(())
    }

    /// Move to a final state.
    ///
    /// Successful reasons yield [`RequestState::Completed`], failures
    /// [`RequestState::Failed`]. Finishing twice is an error.
    pub fn finish(&mut self, reason: FinishReason, error: Option<String>) -> Result<()> {
        if self.state.is_finished() {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: if reason.is_failure() {
                    "Failed"
                } else {
                    "Completed"
                },
            });
        }
        self.state = if reason.is_failure() {
            RequestState::Failed
        } else {
            RequestState::Completed
        };
        self.finish_reason = Some(reason);
        self.error = error;
        self.block_table.clear();
        Ok(())
    }

    fn transition(&mut self, from: RequestState, to: RequestState) -> Result<()> {
        if self.state != from {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        Ok(())
    }
}
