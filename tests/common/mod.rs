//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde_json::{Map, Value};

use rolling_batch::engine::{ModelBackend, ShardWorker, StepBatch, StepLogits, StepPhase};
use rolling_batch::{Error, Result, TextCodec};

pub const VOCAB_SIZE: usize = 32;
pub const EOS_TOKEN: u32 = 0;

/// Deterministic next-token rule.
///
/// Depends only on the last fed token and its position, so a request
/// recomputed after preemption continues exactly where it left off.
pub fn next_token(last: u32, position: usize) -> u32 {
    1 + ((last as usize * 7 + position) % (VOCAB_SIZE - 1)) as u32
}

/// Full logits row favouring [`next_token`], or EOS from `eos_position` on.
pub fn logits_row(last: u32, position: usize, eos_position: Option<usize>) -> Vec<f32> {
    let favoured = match eos_position {
        Some(eos) if position >= eos => EOS_TOKEN,
        _ => next_token(last, position),
    };
    let mut row: Vec<f32> = (0..VOCAB_SIZE).map(|i| (i % 5) as f32 * 0.1).collect();
    row[favoured as usize] = 10.0;
    row
}

/// Position of the last fed token and the token itself.
fn last_fed(input_ids: &[u32], start_position: usize) -> (u32, usize) {
    let last = input_ids.last().copied().unwrap_or(EOS_TOKEN);
    (last, start_position + input_ids.len().saturating_sub(1))
}

/// In-process backend with failure injection and call recording.
#[derive(Debug, Default)]
pub struct FakeBackend {
    /// Upcoming calls that fail.
    pub fail_next: usize,
    /// Emit EOS once the fed position reaches this value.
    pub eos_position: Option<usize>,
    /// Readiness flag shared with the test.
    pub ready: Option<Arc<AtomicBool>>,
    pub calls: usize,
    pub batch_sizes: Vec<usize>,
    /// Tokens fed by prefill inputs, per call.
    pub prefill_tokens: Vec<usize>,
    /// Extras seen on prefill inputs, in call order.
    pub prefill_extras: Vec<Map<String, Value>>,
    pub decode_inputs_with_extras: usize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        Self {
            fail_next: times,
            ..Self::default()
        }
    }

    pub fn with_readiness(flag: Arc<AtomicBool>) -> Self {
        Self {
            ready: Some(flag),
            ..Self::default()
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.batch_sizes.iter().copied().max().unwrap_or(0)
    }
}

impl ModelBackend for FakeBackend {
    fn is_ready(&self) -> bool {
        self.ready
            .as_ref()
            .map_or(true, |flag| flag.load(Ordering::SeqCst))
    }

    fn execute(&mut self, batch: &StepBatch) -> Result<StepLogits> {
        self.calls += 1;
        self.batch_sizes.push(batch.len());
        self.prefill_tokens.push(
            batch
                .inputs
                .iter()
                .filter(|input| input.phase == StepPhase::Prefill)
                .map(|input| input.input_ids.len())
                .sum(),
        );
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Backend("injected backend failure".to_string()));
        }

        let mut logits = StepLogits::new();
        for input in &batch.inputs {
            match (input.phase, &input.extras) {
                (StepPhase::Prefill, Some(extras)) => self.prefill_extras.push(extras.clone()),
                (StepPhase::Decode, Some(_)) => self.decode_inputs_with_extras += 1,
                _ => {}
            }
            let (last, position) = last_fed(&input.input_ids, input.start_position);
            let row = logits_row(last, position, self.eos_position);
            logits.insert(input.request_id, Tensor::new(row.as_slice(), &Device::Cpu)?);
        }
        Ok(logits)
    }
}

/// One tensor-parallel shard: returns its slice of the fake vocabulary.
#[derive(Debug)]
pub struct FakeShard {
    pub rank: usize,
    pub degree: usize,
}

impl ShardWorker for FakeShard {
    fn forward(&mut self, batch: &StepBatch) -> Result<StepLogits> {
        let shard = VOCAB_SIZE / self.degree;
        let range = self.rank * shard..(self.rank + 1) * shard;

        let mut logits = StepLogits::new();
        for input in &batch.inputs {
            let (last, position) = last_fed(&input.input_ids, input.start_position);
            let row = logits_row(last, position, None);
            logits.insert(
                input.request_id,
                Tensor::new(&row[range.clone()], &Device::Cpu)?,
            );
        }
        Ok(logits)
    }
}

pub fn shards(degree: usize) -> Vec<FakeShard> {
    (0..degree).map(|rank| FakeShard { rank, degree }).collect()
}

/// Character-level codec over the fake vocabulary.
///
/// `a..z` are tokens 1..=26, space is 27, `.` is 28, everything else 29.
/// Token 30 decodes to `!` and 31 to `?`; EOS decodes to nothing.
#[derive(Debug, Default)]
pub struct CharCodec;

impl CharCodec {
    pub fn shared() -> Arc<dyn TextCodec> {
        Arc::new(Self)
    }
}

impl TextCodec for CharCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .to_lowercase()
            .chars()
            .map(|c| match c {
                'a'..='z' => c as u32 - 'a' as u32 + 1,
                ' ' => 27,
                '.' => 28,
                _ => 29,
            })
            .collect())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        Ok(token_ids
            .iter()
            .filter_map(|&t| match t {
                EOS_TOKEN => None,
                1..=26 => char::from_u32('a' as u32 + t - 1),
                27 => Some(' '),
                28 => Some('.'),
                29 => Some('#'),
                30 => Some('!'),
                _ => Some('?'),
            })
            .collect())
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        vec![EOS_TOKEN]
    }
}

/// Decode the tokens the fake backend produces for a prompt, greedily.
pub fn expected_tokens(codec: &dyn TextCodec, prompt: &str, max_new_tokens: usize) -> Vec<u32> {
    let prompt_ids = codec.encode(prompt).unwrap_or_default();
    let mut last = prompt_ids.last().copied().unwrap_or(EOS_TOKEN);
    let mut position = prompt_ids.len().saturating_sub(1);
    let mut tokens = Vec::with_capacity(max_new_tokens);
    for _ in 0..max_new_tokens {
        let token = next_token(last, position);
        tokens.push(token);
        last = token;
        position += 1;
    }
    tokens
}
