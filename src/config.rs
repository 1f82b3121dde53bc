//! Configuration types for rolling-batch.
//!
//! [`RollingBatchConfig`] is the startup configuration of a serving instance.
//! It can be deserialized from JSON or loaded from a `serving.properties`
//! style file, where every key may carry an `option.` prefix:
//!
//! ```text
//! option.tensor_parallel_degree=2
//! option.dtype=fp16
//! option.max_rolling_batch_size=8
//! option.model_loading_timeout=7200
//! option.max_rolling_batch_prefill_tokens=10000
//! option.paged_attention=True
//! ```
//!
//! [`GenerationParams`] are the per-request parameters parsed from the
//! request payload.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::block::{compute_num_blocks, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};

/// Temperatures below this are treated as greedy decoding.
pub const GREEDY_TEMPERATURE_EPSILON: f32 = 1e-4;

/// Numeric precision requested from the model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    #[default]
    Fp16,
    Bf16,
    Fp32,
}

impl ModelDType {
    /// The candle dtype backing this precision.
    pub fn to_dtype(self) -> candle_core::DType {
        match self {
            Self::Fp16 => candle_core::DType::F16,
            Self::Bf16 => candle_core::DType::BF16,
            Self::Fp32 => candle_core::DType::F32,
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fp16" | "float16" | "f16" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "fp32" | "float32" | "f32" => Ok(Self::Fp32),
            other => Err(Error::Config(format!("unsupported dtype: {other}"))),
        }
    }
}

/// How result records are serialized for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatter {
    /// A single JSON array per response.
    #[default]
    Json,
    /// One JSON object per line.
    JsonLines,
}

impl OutputFormatter {
    /// Content type advertised for this format.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::JsonLines => "application/jsonlines",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonlines" => Ok(Self::JsonLines),
            other => Err(Error::Config(format!("unsupported output_formatter: {other}"))),
        }
    }
}

/// Request body layout understood by the boundary.
///
/// Chosen once when the service is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputParser {
    /// `{"inputs": "...", "parameters": {...}}`
    #[default]
    Standard,
    /// `{"prompt": "...", "max_tokens": 100, ...}`; every key but `prompt`
    /// is a generation parameter.
    #[serde(rename = "openai")]
    OpenAiCompletion,
}

impl InputParser {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "standard" | "default" => Ok(Self::Standard),
            "openai" | "open_ai" => Ok(Self::OpenAiCompletion),
            other => Err(Error::Config(format!("unsupported input_parser: {other}"))),
        }
    }
}

/// Startup configuration for a rolling batch instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingBatchConfig {
    /// Number of cooperating execution workers (tensor-parallel shards).
    pub tensor_parallel_degree: usize,
    /// Numeric precision used by the backend.
    pub dtype: ModelDType,
    /// Maximum number of concurrently active requests.
    pub max_rolling_batch_size: usize,
    /// Seconds to wait for the backend to become ready.
    pub model_loading_timeout: u64,
    /// Prompt token budget admitted for prefill per step.
    pub max_rolling_batch_prefill_tokens: usize,
    /// Paged (on-demand) cache blocks instead of contiguous reservations.
    pub paged_attention: bool,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Explicit pool size; used when no memory budget is configured.
    pub num_cache_blocks: usize,
    /// KV cache memory budget in bytes.
    pub kv_cache_memory_bytes: Option<u64>,
    /// KV cache bytes needed per token (all layers, keys and values).
    pub kv_cache_bytes_per_token: Option<u64>,
    /// Serialization of result records.
    pub output_formatter: OutputFormatter,
    /// Request body layout.
    pub input_parser: InputParser,
}

impl Default for RollingBatchConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_degree: 1,
            dtype: ModelDType::Fp16,
            max_rolling_batch_size: 32,
            model_loading_timeout: 240,
            max_rolling_batch_prefill_tokens: 4096,
            paged_attention: true,
            block_size: DEFAULT_BLOCK_SIZE,
            num_cache_blocks: 1024,
            kv_cache_memory_bytes: None,
            kv_cache_bytes_per_token: None,
            output_formatter: OutputFormatter::Json,
            input_parser: InputParser::Standard,
        }
    }
}

impl RollingBatchConfig {
    /// Build a configuration from string properties.
    ///
    /// Keys may be prefixed with `option.`. Unknown keys are ignored so the
    /// same properties map can carry backend-specific options.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        for (raw_key, raw_value) in properties {
            let key = raw_key.strip_prefix("option.").unwrap_or(raw_key);
            let value = raw_value.trim();
            match key {
                "tensor_parallel_degree" => config.tensor_parallel_degree = parse_num(key, value)?,
                "dtype" => config.dtype = ModelDType::parse(value)?,
                "max_rolling_batch_size" => config.max_rolling_batch_size = parse_num(key, value)?,
                "model_loading_timeout" => config.model_loading_timeout = parse_num(key, value)?,
                "max_rolling_batch_prefill_tokens" => {
                    config.max_rolling_batch_prefill_tokens = parse_num(key, value)?
                }
                "paged_attention" => config.paged_attention = parse_bool(key, value)?,
                "block_size" => config.block_size = parse_num(key, value)?,
                "num_cache_blocks" => config.num_cache_blocks = parse_num(key, value)?,
                "kv_cache_memory_bytes" => {
                    config.kv_cache_memory_bytes = Some(parse_num(key, value)?)
                }
                "kv_cache_bytes_per_token" => {
                    config.kv_cache_bytes_per_token = Some(parse_num(key, value)?)
                }
                "output_formatter" => config.output_formatter = OutputFormatter::parse(value)?,
                "input_parser" => config.input_parser = InputParser::parse(value)?,
                _ => tracing::debug!(key = %raw_key, "ignoring unrecognized property"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a `serving.properties` style file (`key=value` per line, `#` comments).
    pub fn from_properties_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut properties = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed property line: {line}")))?;
            properties.insert(key.trim().to_string(), value.trim().to_string());
        }

        Self::from_properties(&properties)
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all limits are usable.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("tensor_parallel_degree", self.tensor_parallel_degree),
            ("max_rolling_batch_size", self.max_rolling_batch_size),
            ("max_rolling_batch_prefill_tokens", self.max_rolling_batch_prefill_tokens),
            ("block_size", self.block_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        if self.num_cache_blocks()? == 0 {
            return Err(Error::Config("KV cache budget is smaller than one block".into()));
        }
        Ok(())
    }

    /// Number of blocks in the KV cache pool.
    ///
    /// Derived from the memory budget when both `kv_cache_memory_bytes` and
    /// `kv_cache_bytes_per_token` are set, otherwise `num_cache_blocks`.
    pub fn num_cache_blocks(&self) -> Result<usize> {
        match (self.kv_cache_memory_bytes, self.kv_cache_bytes_per_token) {
            (Some(budget), Some(per_token)) => {
                if per_token == 0 {
                    return Err(Error::Config("kv_cache_bytes_per_token must be non-zero".into()));
                }
                let bytes_per_block = per_token * self.block_size as u64;
                Ok((budget / bytes_per_block) as usize)
            }
            (None, None) => Ok(self.num_cache_blocks),
            _ => Err(Error::Config(
                "kv_cache_memory_bytes and kv_cache_bytes_per_token must be set together".into(),
            )),
        }
    }

    /// Backend readiness timeout.
    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.model_loading_timeout)
    }

    /// Blocks a request reserves up front under the contiguous layout.
    pub fn contiguous_footprint(&self, prompt_len: usize, max_new_tokens: usize) -> usize {
        compute_num_blocks(prompt_len + max_new_tokens, self.block_size)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got {value:?}"))),
    }
}

/// Per-request generation parameters.
///
/// Unrecognized keys are preserved in [`extras`](Self::extras) and handed to
/// the backend untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Maximum tokens to generate.
    #[serde(alias = "max_tokens")]
    pub max_new_tokens: usize,
    /// Draw from the distribution instead of taking the argmax.
    pub do_sample: bool,
    /// Temperature for sampling (1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// RNG seed for reproducible sampling.
    pub seed: Option<u64>,
    /// Stop strings matched against the decoded output.
    #[serde(alias = "stop_sequences")]
    pub stop: Vec<String>,
    /// Backend-specific options.
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            do_sample: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            seed: None,
            stop: Vec::new(),
            extras: Map::new(),
        }
    }
}

impl GenerationParams {
    /// Greedy parameters with the given token limit.
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Self::default()
        }
    }

    /// Parse parameters from a JSON object.
    pub fn from_map(map: Map<String, Value>) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }

    /// Whether sampling reduces to argmax.
    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature < GREEDY_TEMPERATURE_EPSILON
    }

    /// Check ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidParameter {
                name: "temperature",
                reason: format!("must be a non-negative number, got {}", self.temperature),
            });
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidParameter {
                name: "top_p",
                reason: format!("must be in (0, 1], got {}", self.top_p),
            });
        }
        Ok(())
    }
}
