//! Rolling batch engine.
//!
//! This module contains:
//! - RollingBatch for orchestrating steps
//! - StepExecutor and the ModelBackend seam
//! - Sampler for token selection and stop conditions
//! - TextCodec for tokenization

pub mod coordinator;
pub mod executor;
pub mod sampler;
pub mod tokenizer;

pub use coordinator::{RequestOutput, RollingBatch};
pub use executor::{
    ModelBackend, ShardWorker, ShardedBackend, StepBatch, StepExecutor, StepInput, StepLogits,
    StepPhase,
};
pub use sampler::{SampleOutput, Sampler, StopCriteria};
pub use tokenizer::TextCodec;
