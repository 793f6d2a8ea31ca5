//! Collaborator abstraction layer for Cadence.
//!
//! This crate defines the value types exchanged with the systems the
//! evaluation core drives (input pipelines, step functions, checkpoint
//! stores) and the input-pipeline contract itself.

mod tensor;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use tensor::{ShapeTree, Tensor, TensorTree};

/// An error reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollaboratorError {
    /// Tensor shapes did not line up.
    #[error("Shape Error: {0}")]
    Shape(String),

    /// The input pipeline failed for a reason other than exhaustion.
    #[error("Input Error: {0}")]
    Input(String),

    /// The compiled step function failed.
    #[error("Step Error: {0}")]
    Step(String),

    /// The checkpoint store failed to read or write.
    #[error("Store Error: {0}")]
    Store(String),

    /// The external scorer failed.
    #[error("Scorer Error: {0}")]
    Scorer(String),

    /// A summary sink rejected a write.
    #[error("Summary Error: {0}")]
    Summary(String),

    /// Other unexpected errors.
    #[error("Other Collaborator Error: {0}")]
    Other(String),
}

/// Outcome of pulling a batch that did not produce one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    /// The iterator has no more batches. Whether this is fatal depends on the
    /// caller's step budget.
    #[error("input pipeline is out of range")]
    OutOfRange,

    /// The pipeline itself failed.
    #[error(transparent)]
    Failed(#[from] CollaboratorError),
}

/// One batch of model inputs, keyed by feature name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Feature tensors; each has the batch as its leading axis.
    pub features: BTreeMap<String, Tensor>,
    /// Number of real (non-padding) examples in the batch.
    pub num_examples: usize,
}

impl Batch {
    #[must_use]
    pub fn new(num_examples: usize) -> Self {
        Self { features: BTreeMap::new(), num_examples }
    }

    /// Adds a feature tensor.
    #[must_use]
    pub fn with_feature(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.features.insert(name.into(), tensor);
        self
    }
}

/// One example's output, already moved off-device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerExampleRecord {
    /// Stable identifier of the example within its dataset.
    pub enumeration_id: String,
    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
}

impl PerExampleRecord {
    #[must_use]
    pub fn new(enumeration_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { enumeration_id: enumeration_id.into(), payload }
    }
}

/// A named, resumable batch iterator over one dataset split.
///
/// Implementations own their cursor. `get_next` returns
/// [`InputError::OutOfRange`] once exhausted; `reset` rewinds to the start.
pub trait InputPipeline: Send {
    /// Unique name of the split; used in output paths.
    fn name(&self) -> &str;

    /// Pulls the next batch.
    fn get_next(&mut self) -> Result<Batch, InputError>;

    /// Pulls the next batch padded to the global batch size. Defaults to
    /// [`InputPipeline::get_next`] for pipelines that never pad.
    fn get_next_padded(&mut self) -> Result<Batch, InputError> {
        self.get_next()
    }

    /// Rewinds the iterator.
    fn reset(&mut self) -> Result<(), CollaboratorError>;

    /// Batch size across all hosts.
    fn global_batch_size(&self) -> usize;
}
