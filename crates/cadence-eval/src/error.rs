use cadence_abstraction::CollaboratorError;
use thiserror::Error;

pub type EvalResult<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Error)]
pub enum EvalError {
    /// A checkpoint exists on disk but cannot be restored. Not retried.
    #[error("checkpoint at step {step} is corrupt: {reason}")]
    CheckpointCorrupt { step: u64, reason: String },

    /// Two metric accumulators with different key sets were merged.
    #[error("metric keys don't match: {left:?} vs {right:?}")]
    KeyMismatch { left: Vec<String>, right: Vec<String> },

    /// Same key set, but the accumulators under a key are incompatible.
    #[error("accumulator mismatch at '{key}': {reason}")]
    AccumulatorMismatch { key: String, reason: String },

    /// A fixed step budget promised more batches than the split delivered.
    #[error("split '{split}' ran out of data after {consumed} of {budget} batches")]
    DataExhaustedEarly { split: String, budget: i64, consumed: u64 },

    /// The tracked metric is absent from a split's results. Logged, never
    /// propagated out of the tracker.
    #[error("tracked metric '{metric}' missing for split '{split}'")]
    MissingTrackedMetric { metric: String, split: String },

    /// A model state was requested while another one is still live on the
    /// devices.
    #[error("a model state for step {live_step} is still live; release it before loading another")]
    StateAlreadyLive { live_step: u64 },

    #[error("invalid evaluation config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
