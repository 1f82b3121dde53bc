//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - FIFO admission under slot, prefill-token and cache-block budgets
//! - Cache growth for running requests, with preemption under pressure

pub mod admission;

pub use admission::{AdmissionController, SchedulerOutputs};
