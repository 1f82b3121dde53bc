//! Rolling batch coordinator.
//!
//! [`RollingBatch`] ties the registry, allocator, admission controller,
//! executor and samplers together. Each [`step`](RollingBatch::step)
//! advances every active request by exactly one token.
//!
//! ## Step Flow
//!
//! ```text
//!   add_request() / inference()
//!            │
//!            ▼
//!   ┌─────────────────┐   grow running, admit pending FIFO,
//!   │  AdmitPending   │   reject oversize, settle zero-token
//!   └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐   prefill + decode in one backend call
//!   │     Execute     │   (one retry; persistent failure is fatal)
//!   └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐   next token + stop conditions
//!   │     Sample      │   per request
//!   └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐   Prefilling → Decoding,
//!   │   UpdateState   │   done → Completed (blocks released)
//!   └─────────────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐   token/text delta per tracked request,
//!   │      Emit       │   finished requests removed after delivery
//!   └─────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::executor::{ModelBackend, StepBatch, StepExecutor, StepInput, StepPhase};
use super::sampler::{Sampler, StopCriteria};
use super::tokenizer::TextCodec;
use crate::config::{GenerationParams, RollingBatchConfig};
use crate::core::block_allocator::{BlockAllocator, CacheLayout};
use crate::core::registry::RequestRegistry;
use crate::core::sequence::{FinishReason, Request, RequestId, RequestState};
use crate::error::{Error, Result};
use crate::scheduler::AdmissionController;

/// Output record for one tracked request after a step.
///
/// Carries only what was produced since the previous record for the same
/// request; concatenating all records yields the full output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutput {
    #[serde(skip)]
    pub request_id: RequestId,
    /// Newly decoded text.
    #[serde(rename = "data")]
    pub text: String,
    /// Newly generated token ids.
    pub token_ids: Vec<u32>,
    /// Final record for this request.
    #[serde(rename = "last")]
    pub finished: bool,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

/// Continuous batching coordinator over a model backend.
pub struct RollingBatch<B> {
    config: RollingBatchConfig,
    registry: RequestRegistry,
    allocator: BlockAllocator,
    admission: AdmissionController,
    executor: StepExecutor<B>,
    codec: Arc<dyn TextCodec>,
    stop: Arc<StopCriteria>,
    /// Per-request samplers, created at submission.
    samplers: HashMap<RequestId, Sampler>,
    num_steps: u64,
}

impl<B: ModelBackend> RollingBatch<B> {
    /// Create a coordinator.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated startup configuration
    /// * `backend` - Model execution backend
    /// * `codec` - Tokenizer used for prompts, stop strings and text deltas
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is unusable.
    pub fn new(config: RollingBatchConfig, backend: B, codec: Arc<dyn TextCodec>) -> Result<Self> {
        config.validate()?;

        let num_blocks = config.num_cache_blocks()?;
        let layout = CacheLayout::from_paged_attention(config.paged_attention);
        let allocator = BlockAllocator::new(num_blocks, config.block_size, layout);
        let admission = AdmissionController::new(
            config.max_rolling_batch_size,
            config.max_rolling_batch_prefill_tokens,
        );

        info!(
            num_blocks,
            block_size = config.block_size,
            ?layout,
            max_batch_size = config.max_rolling_batch_size,
            max_prefill_tokens = config.max_rolling_batch_prefill_tokens,
            "rolling batch created"
        );

        Ok(Self {
            registry: RequestRegistry::new(config.block_size),
            allocator,
            admission,
            executor: StepExecutor::new(backend),
            stop: Arc::new(StopCriteria::from_codec(codec.clone())),
            codec,
            samplers: HashMap::new(),
            num_steps: 0,
            config,
        })
    }

    /// Wait for the backend, bounded by `model_loading_timeout`.
    pub fn wait_until_ready(&self) -> Result<()> {
        self.executor.wait_until_ready(self.config.loading_timeout())
    }

    // ========== Submission ==========

    /// Submit a tokenized prompt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an empty prompt or
    /// out-of-range parameters. Nothing is registered in that case.
    pub fn add_request(
        &mut self,
        prompt_token_ids: Vec<u32>,
        params: GenerationParams,
    ) -> Result<RequestId> {
        check_request(&prompt_token_ids, &params)?;
        Ok(self.insert_request(prompt_token_ids, params))
    }

    /// Tokenize and submit a text prompt.
    pub fn add_prompt(&mut self, prompt: &str, params: GenerationParams) -> Result<RequestId> {
        let prompt_token_ids = self.codec.encode(prompt)?;
        self.add_request(prompt_token_ids, params)
    }

    /// Submit several text prompts sharing one parameter set, all or none.
    ///
    /// Every prompt is tokenized and checked before any is registered, so
    /// an error leaves nothing submitted.
    pub fn add_prompts<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        params: &GenerationParams,
    ) -> Result<Vec<RequestId>> {
        let encoded = prompts
            .iter()
            .map(|prompt| {
                let token_ids = self.codec.encode(prompt.as_ref())?;
                check_request(&token_ids, params)?;
                Ok(token_ids)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(encoded
            .into_iter()
            .map(|token_ids| self.insert_request(token_ids, params.clone()))
            .collect())
    }

    fn insert_request(&mut self, prompt_token_ids: Vec<u32>, params: GenerationParams) -> RequestId {
        let sampler = Sampler::for_params(self.stop.clone(), &params);
        let prompt_len = prompt_token_ids.len();
        let id = self.registry.insert(prompt_token_ids, params);
        self.samplers.insert(id, sampler);

        debug!(request_id = id, prompt_len, "request added");
        id
    }

    /// Track a request that failed before it could be queued.
    ///
    /// It gets a final record on the next step like any other request.
    fn add_rejected(&mut self, params: GenerationParams, err: &Error) -> Result<RequestId> {
        let id = self.registry.insert(Vec::new(), params);
        self.registry.retire(
            id,
            FinishReason::InvalidRequest,
            Some(err.to_string()),
            &mut self.allocator,
        )?;
        Ok(id)
    }

    // ========== Step ==========

    /// Advance every active request by one token.
    ///
    /// Returns one record per tracked request, in submission order. A step
    /// with nothing tracked returns an empty list without calling the
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendFailure`] when the backend fails twice in a
    /// row. The requests of that step are failed, released and dropped;
    /// pending requests are untouched.
    pub fn step(&mut self) -> Result<Vec<RequestOutput>> {
        if self.registry.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let scheduled = self
            .admission
            .schedule(&mut self.registry, &mut self.allocator)?;
        let batch = self.build_batch()?;

        if !batch.is_empty() {
            let logits = match self.executor.execute(&batch) {
                Ok(logits) => logits,
                Err(err) => return Err(self.fail_step(err)),
            };

            for input in &batch.inputs {
                let id = input.request_id;
                let Some(row) = logits.get(id) else {
                    continue;
                };
                if let Err(err) = self.advance(id, row) {
                    warn!(request_id = id, error = %err, "sampling failed");
                    self.registry.retire(
                        id,
                        FinishReason::BackendFailure,
                        Some(err.to_string()),
                        &mut self.allocator,
                    )?;
                }
            }
        }

        self.num_steps += 1;
        let outputs = self.emit()?;

        debug!(
            step = self.num_steps,
            prefill = scheduled.prefill_requests.len(),
            decode = scheduled.decode_requests.len(),
            tokens = batch.num_tokens(),
            records = outputs.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "step finished"
        );

        Ok(outputs)
    }

    /// Rolling inference call.
    ///
    /// `prompts` lists, positionally, the prompts of every request still
    /// being waited on followed by new prompts. Entries past the number of
    /// tracked requests are submitted; the rest are continuations. Every
    /// call advances all active requests by one step.
    ///
    /// A prompt that cannot be submitted yields a failed final record at its
    /// position instead of failing the call.
    ///
    /// # Errors
    ///
    /// On a persistent backend failure every tracked request is dropped and
    /// the error is returned; the caller starts over with an empty list.
    pub fn inference(
        &mut self,
        prompts: &[String],
        params: &[GenerationParams],
    ) -> Result<Vec<RequestOutput>> {
        if prompts.len() != params.len() {
            return Err(Error::InvalidParameter {
                name: "parameters",
                reason: format!(
                    "expected {} parameter sets, got {}",
                    prompts.len(),
                    params.len()
                ),
            });
        }

        let tracked = self.registry.len();
        for (prompt, params) in prompts.iter().zip(params).skip(tracked) {
            if let Err(err) = self.add_prompt(prompt, params.clone()) {
                debug!(error = %err, "rejecting new request");
                self.add_rejected(params.clone(), &err)?;
            }
        }

        match self.step() {
            Err(err @ Error::BackendFailure { .. }) => {
                self.reset();
                Err(err)
            }
            result => result,
        }
    }

    /// Run steps until nothing is tracked and return one combined record per
    /// request, in submission order.
    pub fn generate(&mut self) -> Result<Vec<RequestOutput>> {
        let mut combined: Vec<RequestOutput> = Vec::new();

        while !self.registry.is_empty() {
            for output in self.step()? {
                match combined
                    .iter_mut()
                    .find(|seen| seen.request_id == output.request_id)
                {
                    Some(seen) => {
                        seen.text.push_str(&output.text);
                        seen.token_ids.extend(output.token_ids);
                        seen.finished = output.finished;
                        seen.finish_reason = output.finish_reason;
                        seen.error = output.error;
                    }
                    None => combined.push(output),
                }
            }
        }

        Ok(combined)
    }

    // ========== Request control ==========

    /// Cancel a request that has not finished.
    ///
    /// Blocks are released immediately. Output delivered so far stays
    /// delivered; the returned record carries anything not yet emitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOrCompletedRequest`] if the request is not
    /// tracked or already finished.
    pub fn cancel(&mut self, id: RequestId) -> Result<RequestOutput> {
        if self.registry.get(id)?.state().is_finished() {
            return Err(Error::UnknownOrCompletedRequest(id));
        }
        self.registry
            .retire(id, FinishReason::Cancelled, None, &mut self.allocator)?;
        info!(request_id = id, "request cancelled");

        let output = self.emit_one(id)?;
        self.drop_request(id);
        Ok(output)
    }

    /// Look up a tracked request.
    pub fn request(&self, id: RequestId) -> Result<&Request> {
        self.registry.get(id)
    }

    /// Fail every in-flight request and return the pool to empty.
    ///
    /// Returns the final record of each request that had not yet been
    /// delivered as finished.
    pub fn reset(&mut self) -> Vec<RequestOutput> {
        let ids: Vec<RequestId> = self.registry.submission_order().to_vec();
        let mut outputs = Vec::with_capacity(ids.len());

        for id in ids {
            let unfinished = self
                .registry
                .get(id)
                .map(|request| !request.state().is_finished())
                .unwrap_or(false);
            if unfinished {
                // Cannot fail: the request is tracked and not finished.
                let _ = self.registry.retire(
                    id,
                    FinishReason::Cancelled,
                    Some("rolling batch reset".to_string()),
                    &mut self.allocator,
                );
            }
            if let Ok(output) = self.emit_one(id) {
                outputs.push(output);
            }
            self.drop_request(id);
        }

        self.allocator.reset();
        info!(num_requests = outputs.len(), "rolling batch reset");
        outputs
    }

    // ========== Counters ==========

    pub fn config(&self) -> &RollingBatchConfig {
        &self.config
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn backend(&self) -> &B {
        self.executor.backend()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.executor.backend_mut()
    }

    /// Steps executed since creation.
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    /// Requests tracked, including finished ones awaiting delivery.
    pub fn num_tracked(&self) -> usize {
        self.registry.len()
    }

    pub fn num_pending(&self) -> usize {
        self.registry.num_pending()
    }

    pub fn num_running(&self) -> usize {
        self.registry.num_running()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free_blocks()
    }

    pub fn has_unfinished_requests(&self) -> bool {
        !self.registry.is_empty()
    }

    // ========== Internals ==========

    /// Inputs for every running request, in admission order.
    fn build_batch(&self) -> Result<StepBatch> {
        let mut batch = StepBatch::default();

        for &id in self.registry.running_ids() {
            let request = self.registry.get(id)?;
            let phase = match request.state() {
                RequestState::Prefilling => StepPhase::Prefill,
                _ => StepPhase::Decode,
            };
            let input_ids = request.tokens_to_feed();
            let start_position = request.num_computed_tokens();
            let slot_mapping = request
                .block_table()
                .slot_mapping(start_position, start_position + input_ids.len());
            let extras = match phase {
                StepPhase::Prefill => Some(request.params().extras.clone()),
                StepPhase::Decode => None,
            };

            batch.inputs.push(StepInput {
                request_id: id,
                phase,
                input_ids,
                start_position,
                block_ids: request.block_table().get_physical_block_ids().to_vec(),
                slot_mapping,
                extras,
            });
        }

        Ok(batch)
    }

    /// Sample the next token for one request and apply it.
    fn advance(&mut self, id: RequestId, logits: &candle_core::Tensor) -> Result<()> {
        let request = self.registry.get(id)?;
        let params = request.params().clone();
        let stop = &self.stop;
        let sampler = self
            .samplers
            .entry(id)
            .or_insert_with(|| Sampler::for_params(stop.clone(), &params));
        let sample = sampler.sample(logits, &params, request.output_token_ids())?;

        let request = self.registry.get_mut(id)?;
        request.append_token(sample.token)?;
        if request.state() == RequestState::Prefilling {
            request.set_decoding()?;
        }

        if let Some(reason) = sample.finish_reason {
            debug!(request_id = id, ?reason, output_len = request.output_len(), "request done");
            self.registry.retire(id, reason, None, &mut self.allocator)?;
        }
        Ok(())
    }

    /// Fail and drop the requests of a failed step, returning the error.
    fn fail_step(&mut self, err: Error) -> Error {
        let (failed_requests, message) = match &err {
            Error::BackendFailure {
                failed_requests,
                message,
                ..
            } => (failed_requests.clone(), message.clone()),
            _ => return err,
        };

        warn!(
            num_requests = failed_requests.len(),
            error = %message,
            "backend failure, failing step requests"
        );
        for id in failed_requests {
            if let Err(retire_err) = self.registry.retire(
                id,
                FinishReason::BackendFailure,
                Some(message.clone()),
                &mut self.allocator,
            ) {
                warn!(request_id = id, error = %retire_err, "failed to retire request");
            }
            self.drop_request(id);
        }
        err
    }

    /// Records for all tracked requests; finished ones are dropped after.
    fn emit(&mut self) -> Result<Vec<RequestOutput>> {
        let ids: Vec<RequestId> = self.registry.submission_order().to_vec();
        let mut outputs = Vec::with_capacity(ids.len());

        for id in ids {
            let output = self.emit_one(id)?;
            if output.finished {
                self.drop_request(id);
            }
            outputs.push(output);
        }

        Ok(outputs)
    }

    /// Delta record for one request; advances its delivery cursors.
    fn emit_one(&mut self, id: RequestId) -> Result<RequestOutput> {
        let request = self.registry.get_mut(id)?;
        let finished = request.state().is_finished();
        let token_ids = request.take_token_delta();

        let mut text = String::new();
        let (prefix_offset, read_offset) = request.text_offsets();
        let output = request.output_token_ids();
        if output.len() > read_offset {
            let prefix_text = if read_offset > prefix_offset {
                self.codec.decode(&output[prefix_offset..read_offset])?
            } else {
                String::new()
            };
            let window = self.codec.decode(&output[prefix_offset..])?;

            // A trailing replacement char is a partial multi-byte sequence;
            // trailing whitespace may still be merged with the next token.
            let unsettled = window.ends_with('\u{FFFD}') || window.ends_with(char::is_whitespace);
            if finished || (window.len() > prefix_text.len() && !unsettled) {
                text = suffix_from(&window, prefix_text.len()).to_string();
                let end = output.len();
                request.advance_text_offsets(read_offset, end);
            }
        }

        Ok(RequestOutput {
            request_id: id,
            text,
            token_ids,
            finished,
            finish_reason: request.finish_reason(),
            error: request.error().map(str::to_string),
        })
    }

    fn drop_request(&mut self, id: RequestId) {
        self.registry.remove(id);
        self.samplers.remove(&id);
    }
}

/// Reject an empty prompt or out-of-range parameters.
fn check_request(prompt_token_ids: &[u32], params: &GenerationParams) -> Result<()> {
    if prompt_token_ids.is_empty() {
        return Err(Error::InvalidParameter {
            name: "prompt",
            reason: "prompt must contain at least one token".to_string(),
        });
    }
    params.validate()
}

/// `text` from byte `start`, moved forward to the next char boundary.
fn suffix_from(text: &str, start: usize) -> &str {
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    &text[start..]
}
