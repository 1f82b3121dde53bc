//! Step execution against the model backend.
//!
//! The forward pass itself lives outside this crate, behind
//! [`ModelBackend`]. This module builds on top of it:
//!
//! - [`StepBatch`] / [`StepLogits`]: what goes in and out of one step
//! - [`StepExecutor`]: readiness wait, result validation, one retry
//! - [`ShardedBackend`]: tensor-parallel shards run in lockstep and
//!   presented as one backend
//!
//! ## Tensor Parallel Step
//!
//! ```text
//!                  StepBatch
//!        ┌────────────┼────────────┐
//!        ▼            ▼            ▼
//!    shard 0      shard 1   ...  shard N-1     (scoped threads)
//!   vocab[0..k]  vocab[k..2k]   vocab[..V]
//!        └────────────┼────────────┘
//!                     ▼  join + all-gather
//!                StepLogits [V] per request
//! ```

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::block::BlockId;
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Attempts per step before the failure is reported.
pub const MAX_STEP_ATTEMPTS: usize = 2;

/// Interval between readiness polls.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether a request is fed its prompt or a single token this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Prefill,
    Decode,
}

/// One request's input for a step.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub request_id: RequestId,
    pub phase: StepPhase,
    /// Tokens to feed: the prompt on prefill, the last token on decode.
    pub input_ids: Vec<u32>,
    /// Position of `input_ids[0]` in the sequence.
    pub start_position: usize,
    /// Cache blocks owned by the request, in logical order.
    pub block_ids: Vec<BlockId>,
    /// Cache slot for each fed token.
    pub slot_mapping: Vec<usize>,
    /// Backend-specific request options, sent on prefill only.
    pub extras: Option<Map<String, Value>>,
}

/// Inputs for every active request in one step.
#[derive(Debug, Clone, Default)]
pub struct StepBatch {
    pub inputs: Vec<StepInput>,
}

impl StepBatch {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.inputs.iter().map(|input| input.request_id).collect()
    }

    /// Total tokens fed this step.
    pub fn num_tokens(&self) -> usize {
        self.inputs.iter().map(|input| input.input_ids.len()).sum()
    }
}

/// Next-token logits addressed by request id.
#[derive(Debug, Clone, Default)]
pub struct StepLogits {
    logits: HashMap<RequestId, Tensor>,
}

impl StepLogits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request_id: RequestId, logits: Tensor) {
        self.logits.insert(request_id, logits);
    }

    pub fn get(&self, request_id: RequestId) -> Option<&Tensor> {
        self.logits.get(&request_id)
    }

    pub fn remove(&mut self, request_id: RequestId) -> Option<Tensor> {
        self.logits.remove(&request_id)
    }

    pub fn len(&self) -> usize {
        self.logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logits.is_empty()
    }
}

impl FromIterator<(RequestId, Tensor)> for StepLogits {
    fn from_iter<I: IntoIterator<Item = (RequestId, Tensor)>>(iter: I) -> Self {
        Self {
            logits: iter.into_iter().collect(),
        }
    }
}

/// The model-execution backend.
///
/// Must process every request of the batch exactly once per call.
pub trait ModelBackend: Send {
    /// Whether the model is loaded and can execute steps.
    fn is_ready(&self) -> bool {
        true
    }

    /// Run one forward step.
    fn execute(&mut self, batch: &StepBatch) -> Result<StepLogits>;
}

impl<B: ModelBackend + ?Sized> ModelBackend for Box<B> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn execute(&mut self, batch: &StepBatch) -> Result<StepLogits> {
        (**self).execute(batch)
    }
}

/// Runs steps on a backend with validation and a single retry.
#[derive(Debug)]
pub struct StepExecutor<B> {
    backend: B,
}

impl<B: ModelBackend> StepExecutor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Block until the backend reports ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] once `timeout` has elapsed.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.backend.is_ready() {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "backend ready");
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(Error::BackendUnavailable {
                    timeout_secs: timeout.as_secs(),
                });
            }
            thread::sleep(READY_POLL_INTERVAL.min(timeout - elapsed));
        }
    }

    /// Execute one step.
    ///
    /// A failed or incomplete result fails the whole step; the step is
    /// retried once before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendFailure`] naming every request of the batch.
    pub fn execute(&mut self, batch: &StepBatch) -> Result<StepLogits> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_STEP_ATTEMPTS {
            match self
                .backend
                .execute(batch)
                .and_then(|logits| validate(batch, logits))
            {
                Ok(logits) => return Ok(logits),
                Err(err) => {
                    warn!(
                        attempt,
                        batch_size = batch.len(),
                        error = %err,
                        "backend step failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(Error::BackendFailure {
            attempts: MAX_STEP_ATTEMPTS,
            failed_requests: batch.request_ids(),
            message: last_error,
        })
    }
}

/// Check that every request got exactly one logits row and nothing else.
fn validate(batch: &StepBatch, logits: StepLogits) -> Result<StepLogits> {
    if logits.len() != batch.len() {
        return Err(Error::Backend(format!(
            "batch output size mismatch, expected: {}, actual: {}",
            batch.len(),
            logits.len()
        )));
    }
    if let Some(missing) = batch
        .inputs
        .iter()
        .find(|input| logits.get(input.request_id).is_none())
    {
        return Err(Error::Backend(format!(
            "no logits for request {}",
            missing.request_id
        )));
    }
    Ok(logits)
}

/// One tensor-parallel shard of the model.
///
/// A shard returns the logits for its slice of the vocabulary; slices are
/// concatenated in rank order.
pub trait ShardWorker: Send {
    fn is_ready(&self) -> bool {
        true
    }

    fn forward(&mut self, batch: &StepBatch) -> Result<StepLogits>;
}

/// Tensor-parallel backend made of cooperating shard workers.
///
/// All shards run each step concurrently and the call returns only after
/// every shard has finished, so callers see one synchronous step.
#[derive(Debug)]
pub struct ShardedBackend<W> {
    workers: Vec<W>,
}

impl<W: ShardWorker> ShardedBackend<W> {
    /// Create a backend from shards ordered by rank.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the shard count does not match
    /// `tensor_parallel_degree`.
    pub fn new(workers: Vec<W>, tensor_parallel_degree: usize) -> Result<Self> {
        if workers.len() != tensor_parallel_degree || workers.is_empty() {
            return Err(Error::Config(format!(
                "tensor_parallel_degree is {tensor_parallel_degree} but {} shard workers were given",
                workers.len()
            )));
        }
        Ok(Self { workers })
    }

    pub fn degree(&self) -> usize {
        self.workers.len()
    }

    fn forward_all(&mut self, batch: &StepBatch) -> Result<Vec<StepLogits>> {
        if let [worker] = self.workers.as_mut_slice() {
            return Ok(vec![worker.forward(batch)?]);
        }

        thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter_mut()
                .map(|worker| scope.spawn(move || worker.forward(batch)))
                .collect();

            // Join every shard before looking at any result.
            let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
            joined
                .into_iter()
                .enumerate()
                .map(|(rank, result)| {
                    result.map_err(|_| Error::Backend(format!("shard worker {rank} panicked")))?
                })
                .collect()
        })
    }
}

impl<W: ShardWorker> ModelBackend for ShardedBackend<W> {
    fn is_ready(&self) -> bool {
        self.workers.iter().all(ShardWorker::is_ready)
    }

    fn execute(&mut self, batch: &StepBatch) -> Result<StepLogits> {
        let mut shards = self.forward_all(batch)?;
        if shards.len() == 1 {
            return Ok(shards.remove(0));
        }

        batch
            .inputs
            .iter()
            .map(|input| {
                let id = input.request_id;
                let parts = shards
                    .iter_mut()
                    .enumerate()
                    .map(|(rank, shard)| {
                        shard.remove(id).ok_or_else(|| {
                            Error::Backend(format!("shard {rank} returned no logits for request {id}"))
                        })
                    })
                    .map(|part| part.and_then(|t| Ok(t.flatten_all()?)))
                    .collect::<Result<Vec<Tensor>>>()?;
                Ok((id, Tensor::cat(&parts, 0)?))
            })
            .collect()
    }
}
