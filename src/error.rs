//! Error types for rolling-batch.

use thiserror::Error;

use crate::core::sequence::RequestId;

/// Result type alias for rolling-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rolling-batch.
#[derive(Error, Debug)]
pub enum Error {
    /// The prompt alone exceeds the per-step prefill token budget.
    #[error("prompt has {prompt_tokens} tokens, exceeding the prefill budget of {budget}")]
    PromptTooLarge { prompt_tokens: usize, budget: usize },

    /// Prompt plus `max_new_tokens` can never fit the cache pool.
    #[error("request needs {required_tokens} cache slots, the pool holds {pool_tokens}")]
    ExceedsCachePool {
        required_tokens: usize,
        pool_tokens: usize,
    },

    /// A preempted request can no longer be recomputed in one prefill.
    #[error("recompute of {tokens} tokens after preemption exceeds the prefill budget of {budget}")]
    RecomputeTooLarge { tokens: usize, budget: usize },

    /// Cache blocks or batch slots are momentarily exhausted.
    #[error("out of capacity: requested {requested} blocks, {available} available")]
    OutOfCapacity { requested: usize, available: usize },

    /// The model backend failed to execute a step.
    #[error("backend failed after {attempts} attempt(s): {message}")]
    BackendFailure {
        attempts: usize,
        failed_requests: Vec<RequestId>,
        message: String,
    },

    /// The backend returned an unusable result for a single attempt.
    #[error("backend error: {0}")]
    Backend(String),

    /// Logits could not be turned into a token.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// The backend did not become ready within the loading timeout.
    #[error("backend not ready after {timeout_secs}s")]
    BackendUnavailable { timeout_secs: u64 },

    /// Request is not tracked (never existed or already delivered).
    #[error("request {0} is unknown or already completed")]
    UnknownOrCompletedRequest(RequestId),

    /// A boundary item could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Invalid request state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A generation parameter is out of range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current service state.
    #[error("service is {actual}, expected {expected}")]
    ServiceState {
        expected: &'static str,
        actual: &'static str,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the condition is expected to clear on a later step.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfCapacity { .. })
    }
}

/// Failure to turn one raw batch item into a prompt and parameters.
///
/// Always carries the underlying cause so it can be reported per item.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("request body is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("request body is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("request has no `{0}` field")]
    MissingPrompt(&'static str),

    #[error("invalid generation parameters: {0}")]
    InvalidParameters(#[source] serde_json::Error),

    #[error("prompt could not be tokenized: {0}")]
    Tokenization(String),
}
