//! rolling-batch: continuous batching for LLM serving.
//!
//! This crate implements the scheduling layer between a request boundary and
//! a model-execution backend:
//! - Paged (or contiguous) KV cache block allocation
//! - FIFO admission under batch-size, prefill-token and cache budgets
//! - One-token-per-step rolling execution with incremental output
//! - Tensor-parallel shard coordination behind a single backend call

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod service;

pub use config::{GenerationParams, RollingBatchConfig};
pub use engine::{ModelBackend, RequestOutput, RollingBatch, Sampler, TextCodec};
pub use error::{DecodeError, Error, Result};
pub use scheduler::{AdmissionController, SchedulerOutputs};
pub use service::{BatchResponse, RawRequest, Service, ServiceState};
