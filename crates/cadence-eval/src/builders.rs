//! Assembles an evaluation job from its [`EvalConfig`].
//!
//! The config names the splits and decides the device count, the checkpoint
//! layout and metric tracking. The caller supplies what only it can build:
//! one input pipeline, step function and summary sink per configured split.

use crate::checkpoint::{CheckpointStore, FsCheckpointStore, create_checkpointer};
use crate::config::{EvalConfig, SplitConfig};
use crate::contracts::{DecodeProcessor, EarlyStopping, Scorer, StepFunction, SummarySink};
use crate::controller::EvalLoop;
use crate::device::DeviceMemory;
use crate::error::{EvalError, EvalResult};
use crate::layout::EvaluationMode;
use crate::output::OutputWriter;
use crate::runner::{DecodeRunner, EvalRunner, MetricTracking, SplitSpec};
use crate::state::StateMetadata;
use crate::sync::{Clock, HostCoordinator, SingleHost, TokioClock};
use cadence_abstraction::InputPipeline;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// The caller-built pieces of one split.
pub struct SplitParts {
    pub input: Box<dyn InputPipeline>,
    pub step_fn: Arc<dyn StepFunction>,
    pub sink: Arc<dyn SummarySink>,
}

impl SplitParts {
    #[must_use]
    pub fn new(input: Box<dyn InputPipeline>, step_fn: Arc<dyn StepFunction>, sink: Arc<dyn SummarySink>) -> Self {
        Self { input, step_fn, sink }
    }
}

/// Split parts keyed by split name, plus the optional hooks.
#[derive(Default)]
pub struct JobParts {
    pub eval: BTreeMap<String, SplitParts>,
    pub decode: BTreeMap<String, SplitParts>,
    pub processor: Option<Arc<dyn DecodeProcessor>>,
    pub scorer: Option<Arc<dyn Scorer>>,
    pub early_stopping: Option<Arc<dyn EarlyStopping>>,
}

impl JobParts {
    #[must_use]
    pub fn with_eval_split(mut self, parts: SplitParts) -> Self {
        self.eval.insert(parts.input.name().to_string(), parts);
        self
    }

    #[must_use]
    pub fn with_decode_split(mut self, parts: SplitParts) -> Self {
        self.decode.insert(parts.input.name().to_string(), parts);
        self
    }

    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn DecodeProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    #[must_use]
    pub fn with_early_stopping(mut self, predicate: Arc<dyn EarlyStopping>) -> Self {
        self.early_stopping = Some(predicate);
        self
    }
}

/// Process-level collaborators shared by the gateway and the runners.
pub struct JobServices {
    pub store: Arc<dyn CheckpointStore>,
    pub coordinator: Arc<dyn HostCoordinator>,
    pub clock: Arc<dyn Clock>,
}

impl Default for JobServices {
    fn default() -> Self {
        Self { store: Arc::new(FsCheckpointStore::new()), coordinator: Arc::new(SingleHost), clock: Arc::new(TokioClock) }
    }
}

/// A ready-to-run loop and the device memory its states live in.
pub struct EvalJob {
    pub eval_loop: EvalLoop,
    pub memory: DeviceMemory,
}

/// Binds every configured split to its parts, in config order. A configured
/// split without parts, or parts for a split the config doesn't name, is a
/// config error.
pub fn build_splits(
    mode: EvaluationMode,
    configs: &[SplitConfig],
    mut parts: BTreeMap<String, SplitParts>,
) -> EvalResult<Vec<SplitSpec>> {
    let mut splits = Vec::with_capacity(configs.len());
    for config in configs {
        let Some(part) = parts.remove(&config.name) else {
            return Err(EvalError::InvalidConfig(format!(
                "{mode} split '{}' is configured but no input was provided",
                config.name
            )));
        };
        splits.push(SplitSpec::from_config(config, part.input, part.step_fn, part.sink)?);
    }
    if let Some(name) = parts.keys().next() {
        return Err(EvalError::InvalidConfig(format!("{mode} input '{name}' has no configured split")));
    }
    Ok(splits)
}

/// Builds the evaluation loop described by `config`.
///
/// Device memory is sized from `num_devices`. Decode pulls padded batches
/// whenever the checkpoint layout is partitioned, and tracks
/// `tracked_metric` when one is configured.
pub fn build_eval_job(
    config: &EvalConfig,
    parts: JobParts,
    services: JobServices,
    metadata: StateMetadata,
) -> EvalResult<EvalJob> {
    config.validate()?;
    let JobServices { store, coordinator, clock } = services;
    let memory = DeviceMemory::new(config.num_devices);
    let gateway =
        create_checkpointer(config, Arc::clone(&store), Arc::clone(&coordinator), clock, memory.clone());
    let host_index = coordinator.process_index();

    let eval_splits = build_splits(EvaluationMode::Eval, &config.eval_splits, parts.eval)?;
    let mut eval = EvalRunner::new(eval_splits, OutputWriter::from_config(config, host_index), Arc::clone(&coordinator));

    let decode_splits = build_splits(EvaluationMode::Decode, &config.decode_splits, parts.decode)?;
    let mut decode =
        DecodeRunner::new(decode_splits, OutputWriter::from_config(config, host_index), Arc::clone(&coordinator))
            .with_padded_inputs(gateway.pads_inputs());
    if let Some(processor) = parts.processor {
        decode = decode.with_processor(processor);
    }
    if let Some(scorer) = parts.scorer {
        eval = eval.with_scorer(Arc::clone(&scorer));
        decode = decode.with_scorer(scorer);
    }
    if let Some(metric) = config.tracked_metric.clone() {
        decode = decode.with_tracking(MetricTracking {
            metric,
            store,
            enable_checkpoint_saving: config.enable_checkpoint_saving,
        });
    }

    info!(
        eval_splits = config.eval_splits.len(),
        decode_splits = config.decode_splits.len(),
        num_devices = config.num_devices,
        layout = gateway.layout_name(),
        "built evaluation job"
    );
    let mut eval_loop = EvalLoop::new(config.clone(), gateway, coordinator, metadata).with_eval(eval).with_decode(decode);
    if let Some(predicate) = parts.early_stopping {
        eval_loop = eval_loop.with_early_stopping(predicate);
    }
    Ok(EvalJob { eval_loop, memory })
}
