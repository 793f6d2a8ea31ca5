//! Continuous evaluation and decoding of training checkpoints.
//!
//! An [`EvalLoop`] polls a checkpoint directory through a
//! [`CheckpointGateway`], runs every configured decode and eval split
//! against each new model state, writes per-example outputs and summaries,
//! and tracks the best value of a chosen decode metric.

pub mod builders;
pub mod checkpoint;
pub mod config;
pub mod contracts;
pub mod controller;
pub mod device;
pub mod error;
mod fsutil;
pub mod layout;
pub mod metrics;
pub mod output;
pub mod runner;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod tracker;

pub use builders::{EvalJob, JobParts, JobServices, SplitParts, build_eval_job, build_splits};
pub use checkpoint::{
    CheckpointGateway, CheckpointStore, FsCheckpointStore, PartitionedCheckpointer, ProgressMarker,
    ReplicatedCheckpointer, create_checkpointer, resolve_restore_step,
};
pub use config::{EvalConfig, SplitConfig, TrackMode, TrackedMetricConfig};
pub use contracts::{
    DecodeProcessor, EarlyStopping, HostStepOutput, JsonlSummarySink, NullSummarySink, ProcessedDecode, Scorer,
    StepFunction, StepOutput, SummarySink,
};
pub use controller::{EvalLoop, IterationReport, LoopReport, StopReason};
pub use device::{Collect, DeviceMemory, DeviceValues, MemoryStats, SummaryTensors};
pub use error::{EvalError, EvalResult};
pub use layout::{EvalLayout, EvaluationMode};
pub use metrics::{Accumulator, FloatMetrics, MeanMetrics, MetricTree, WeightedScalar, WeightedScalars};
pub use output::{OutputWriter, can_load_written_outputs, load_outputs};
pub use runner::{
    DecodePassMetrics, DecodeRunOutcome, DecodeRunner, EvalPassMetrics, EvalRunOutcome, EvalRunner, MetricTracking,
    SplitSpec,
};
pub use state::{ModelState, PartitionSpec, StateLayout, StateMetadata, TrainState};
pub use sync::{Clock, HostCoordinator, InProcessHost, ManualClock, SingleHost, TokioClock};
pub use tracker::{MetricTracker, TrackerUpdate, find_and_maybe_update_tracked_metric};
