//! Serving boundary.
//!
//! [`Service`] owns one [`RollingBatch`] and turns batches of raw requests
//! into prompts, steps the batch and formats the records.
//!
//! ## Lifecycle
//!
//! ```text
//!   Uninitialized ──initialize()──► Ready ──shutdown()──► ShuttingDown
//!                   (backend ready     │
//!                    within timeout)   └── handle() per tick
//! ```

pub mod parser;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{InputParser, OutputFormatter, RollingBatchConfig};
use crate::core::sequence::RequestId;
use crate::engine::{ModelBackend, RequestOutput, RollingBatch, TextCodec};
use crate::error::{DecodeError, Error, Result};

pub use parser::{decode_batch, decode_item, DecodedBatch, DecodedItem, RawRequest};

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Ready,
    ShuttingDown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Ready => "Ready",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

/// Result of handling one batch.
#[derive(Debug, Default)]
pub struct BatchResponse {
    /// One record per tracked request, in submission order.
    pub outputs: Vec<RequestOutput>,
    /// Requests submitted by this batch, mapped to their item index.
    pub submitted: HashMap<RequestId, usize>,
    /// Items that could not be submitted, keyed by item index.
    pub errors: BTreeMap<usize, Error>,
}

impl BatchResponse {
    /// Serialize the records.
    ///
    /// Per-item errors are not part of the records; they are reported
    /// through [`errors`](Self::errors).
    pub fn format(&self, formatter: OutputFormatter) -> Result<String> {
        match formatter {
            OutputFormatter::Json => Ok(serde_json::to_string(&self.outputs)?),
            OutputFormatter::JsonLines => {
                let mut body = String::new();
                for output in &self.outputs {
                    body.push_str(&serde_json::to_string(output)?);
                    body.push('\n');
                }
                Ok(body)
            }
        }
    }
}

/// Serving instance around a rolling batch.
pub struct Service<B> {
    config: RollingBatchConfig,
    parser: InputParser,
    state: ServiceState,
    batch: Option<RollingBatch<B>>,
}

impl<B: ModelBackend> Service<B> {
    /// Create an uninitialized service. The input parser is fixed here.
    pub fn new(config: RollingBatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            parser: config.input_parser,
            config,
            state: ServiceState::Uninitialized,
            batch: None,
        })
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn config(&self) -> &RollingBatchConfig {
        &self.config
    }

    pub fn rolling_batch(&self) -> Option<&RollingBatch<B>> {
        self.batch.as_ref()
    }

    /// Attach the backend and wait for it to become ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] when the backend is not ready
    /// within `model_loading_timeout`; the service stays uninitialized.
    pub fn initialize(&mut self, backend: B, codec: Arc<dyn TextCodec>) -> Result<()> {
        self.expect_state(ServiceState::Uninitialized)?;

        let batch = RollingBatch::new(self.config.clone(), backend, codec)?;
        batch.wait_until_ready()?;
        self.batch = Some(batch);
        self.state = ServiceState::Ready;

        info!(
            tensor_parallel_degree = self.config.tensor_parallel_degree,
            dtype = ?self.config.dtype,
            parser = ?self.parser,
            "service ready"
        );
        Ok(())
    }

    /// Submit the decodable items of a batch and advance one step.
    ///
    /// A malformed or unsubmittable item is reported in
    /// [`BatchResponse::errors`] and does not affect the others. An empty
    /// batch just advances the requests already in flight.
    pub fn handle(&mut self, items: &[RawRequest]) -> Result<BatchResponse> {
        self.expect_state(ServiceState::Ready)?;
        let batch = self
            .batch
            .as_mut()
            .ok_or(Error::ServiceState {
                expected: ServiceState::Ready.as_str(),
                actual: ServiceState::Uninitialized.as_str(),
            })?;

        let decoded = decode_batch(self.parser, items);
        let mut response = BatchResponse {
            errors: decoded
                .errors
                .into_iter()
                .map(|(index, err)| (index, Error::Decode(err)))
                .collect(),
            ..BatchResponse::default()
        };

        // Prompts of one item are contiguous and share its parameters.
        let mut start = 0;
        while start < decoded.prompts.len() {
            let index = decoded.item_index[start];
            let end = start
                + decoded.item_index[start..]
                    .iter()
                    .take_while(|&&item| item == index)
                    .count();

            match batch.add_prompts(&decoded.prompts[start..end], &decoded.parameters[start]) {
                Ok(ids) => {
                    response.submitted.extend(ids.into_iter().map(|id| (id, index)));
                }
                Err(Error::Tokenization(message)) => {
                    response
                        .errors
                        .insert(index, Error::Decode(DecodeError::Tokenization(message)));
                }
                Err(err) => {
                    response.errors.insert(index, err);
                }
            }
            start = end;
        }

        response.outputs = batch.step()?;
        Ok(response)
    }

    /// Stop serving: every in-flight request is failed and the cache pool
    /// is released. Returns their final records.
    pub fn shutdown(&mut self) -> Vec<RequestOutput> {
        let outputs = match self.batch.as_mut() {
            Some(batch) => batch.reset(),
            None => Vec::new(),
        };
        if !outputs.is_empty() {
            warn!(num_requests = outputs.len(), "shutdown failed in-flight requests");
        }
        self.state = ServiceState::ShuttingDown;
        info!("service shut down");
        outputs
    }

    fn expect_state(&self, expected: ServiceState) -> Result<()> {
        if self.state != expected {
            return Err(Error::ServiceState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }
}
