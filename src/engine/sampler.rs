//! Token sampling and stop evaluation.
//!
//! The sampler turns one request's logits into its next token and decides
//! whether the request is done:
//!
//! - **Greedy** (`do_sample = false`, or temperature ≈ 0): argmax
//! - **Stochastic**: temperature, optional top-k / top-p, weighted draw
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token ──► stop check (EOS, stop string, max tokens)
//! ```

use std::sync::Arc;

use candle_core::{DType, Tensor, D};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::GenerationParams;
use crate::core::sequence::FinishReason;
use crate::engine::tokenizer::TextCodec;
use crate::error::{Error, Result};

/// Conditions that end a request, shared by all samplers.
#[derive(Clone, Default)]
pub struct StopCriteria {
    eos_token_ids: Vec<u32>,
    /// Needed to match stop strings; without it stop strings never match.
    codec: Option<Arc<dyn TextCodec>>,
}

impl std::fmt::Debug for StopCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopCriteria")
            .field("eos_token_ids", &self.eos_token_ids)
            .field("has_codec", &self.codec.is_some())
            .finish()
    }
}

impl StopCriteria {
    pub fn new(eos_token_ids: Vec<u32>) -> Self {
        Self {
            eos_token_ids,
            codec: None,
        }
    }

    /// Use the codec's end-of-sequence tokens and enable stop strings.
    pub fn from_codec(codec: Arc<dyn TextCodec>) -> Self {
        Self {
            eos_token_ids: codec.eos_token_ids(),
            codec: Some(codec),
        }
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// Evaluate the stop conditions on the output including its newest token.
    ///
    /// Checked in order: end-of-sequence token, stop string, token limit.
    pub fn check(&self, params: &GenerationParams, output: &[u32]) -> Result<Option<FinishReason>> {
        let Some(&last) = output.last() else {
            return Ok(None);
        };

        if self.eos_token_ids.contains(&last) {
            return Ok(Some(FinishReason::EndOfSequence));
        }

        if !params.stop.is_empty() {
            if let Some(codec) = &self.codec {
                let text = codec.decode(output)?;
                if params.stop.iter().any(|stop| !stop.is_empty() && text.contains(stop.as_str())) {
                    return Ok(Some(FinishReason::StopString));
                }
            }
        }

        if output.len() >= params.max_new_tokens {
            return Ok(Some(FinishReason::MaxTokens));
        }

        Ok(None)
    }
}

/// Result of sampling one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutput {
    /// Selected token.
    pub token: u32,
    /// Set when the request is done after this token.
    pub finish_reason: Option<FinishReason>,
}

/// Per-request token sampler.
///
/// Each request owns a sampler so a seeded request draws the same sequence
/// no matter which other requests share its batch.
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
    stop: Arc<StopCriteria>,
}

impl Sampler {
    /// Creates a new sampler seeded from entropy.
    pub fn new(stop: Arc<StopCriteria>) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            stop,
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(stop: Arc<StopCriteria>, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            stop,
        }
    }

    /// Sampler for a request, seeded when the request carries a seed.
    pub fn for_params(stop: Arc<StopCriteria>, params: &GenerationParams) -> Self {
        match params.seed {
            Some(seed) => Self::with_seed(stop, seed),
            None => Self::new(stop),
        }
    }

    /// Sample the next token and evaluate the stop conditions.
    ///
    /// # Arguments
    ///
    /// * `logits` - Logits for this request, `[vocab_size]` or `[1, vocab_size]`
    /// * `params` - The request's generation parameters
    /// * `history` - Tokens generated so far, excluding the new one
    pub fn sample(
        &mut self,
        logits: &Tensor,
        params: &GenerationParams,
        history: &[u32],
    ) -> Result<SampleOutput> {
        let token = self.select_token(logits, params)?;

        let mut output = Vec::with_capacity(history.len() + 1);
        output.extend_from_slice(history);
        output.push(token);
        let finish_reason = self.stop.check(params, &output)?;

        Ok(SampleOutput {
            token,
            finish_reason,
        })
    }

    /// Pick a token without evaluating stop conditions.
    pub fn select_token(&mut self, logits: &Tensor, params: &GenerationParams) -> Result<u32> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        if logits.dim(0)? == 0 {
            return Err(Error::Sampling("empty logits".to_string()));
        }

        if params.is_greedy() {
            return argmax(&logits);
        }

        let logits = if params.temperature != 1.0 {
            (&logits / params.temperature as f64)?
        } else {
            logits
        };

        let mut candidates: Vec<(u32, f32)> = logits
            .to_vec1::<f32>()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect();

        if params.top_k > 0 && params.top_k < candidates.len() {
            sort_descending(&mut candidates);
            candidates.truncate(params.top_k);
        }

        let values: Vec<f32> = candidates.iter().map(|&(_, v)| v).collect();
        let num_candidates = values.len();
        let probs = candle_nn::ops::softmax(
            &Tensor::from_vec(values, num_candidates, logits.device())?,
            D::Minus1,
        )?
        .to_vec1::<f32>()?;
        let mut weighted: Vec<(u32, f32)> = candidates
            .iter()
            .zip(probs)
            .map(|(&(token, _), p)| (token, p))
            .collect();

        if params.top_p < 1.0 {
            apply_top_p(&mut weighted, params.top_p);
        }

        self.draw(&weighted)
    }

    /// Sample from the weighted candidates using the stored RNG.
    fn draw(&mut self, weighted: &[(u32, f32)]) -> Result<u32> {
        let sum: f32 = weighted.iter().map(|&(_, p)| p).sum();
        let normalized: Vec<f64> = weighted.iter().map(|&(_, p)| (p / sum) as f64).collect();

        let dist = rand::distributions::WeightedIndex::new(&normalized)
            .map_err(|e| Error::Sampling(format!("failed to create distribution: {e}")))?;

        Ok(weighted[dist.sample(&mut self.rng)].0)
    }
}

/// Greedy decoding: select the token with highest logit.
fn argmax(logits: &Tensor) -> Result<u32> {
    Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
}

fn sort_descending(candidates: &mut [(u32, f32)]) {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

/// Keep the most likely tokens until their cumulative probability exceeds `p`.
fn apply_top_p(weighted: &mut Vec<(u32, f32)>, p: f32) {
    sort_descending(weighted);

    let mut cumulative = 0.0f32;
    let mut cutoff = weighted.len();
    for (i, &(_, prob)) in weighted.iter().enumerate() {
        cumulative += prob;
        if cumulative > p {
            // Include the token that pushed us over
            cutoff = i + 1;
            break;
        }
    }
    weighted.truncate(cutoff);
}
