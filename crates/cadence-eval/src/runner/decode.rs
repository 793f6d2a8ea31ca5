use super::split::{SplitSpec, drive_split};
use super::{DecodePassMetrics, DecodeRunOutcome, stack_summaries, steps_per_sec};
use crate::checkpoint::CheckpointStore;
use crate::config::TrackedMetricConfig;
use crate::contracts::{DecodeProcessor, Scorer};
use crate::device::SummaryTensors;
use crate::error::EvalResult;
use crate::layout::EvaluationMode;
use crate::metrics::{MeanMetrics, MetricTree, update_float_dict};
use crate::output::{OutputWriter, can_load_written_outputs};
use crate::state::ModelState;
use crate::sync::HostCoordinator;
use crate::tracker::find_and_maybe_update_tracked_metric;
use cadence_abstraction::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Which decode metric to track and where best checkpoints go.
pub struct MetricTracking {
    pub metric: TrackedMetricConfig,
    pub store: Arc<dyn CheckpointStore>,
    pub enable_checkpoint_saving: bool,
}

/// Runs every decode split against one model state.
pub struct DecodeRunner {
    splits: Vec<SplitSpec>,
    writer: OutputWriter,
    coordinator: Arc<dyn HostCoordinator>,
    processor: Option<Arc<dyn DecodeProcessor>>,
    scorer: Option<Arc<dyn Scorer>>,
    tracking: Option<MetricTracking>,
    pad_inputs: bool,
}

impl DecodeRunner {
    #[must_use]
    pub fn new(splits: Vec<SplitSpec>, writer: OutputWriter, coordinator: Arc<dyn HostCoordinator>) -> Self {
        Self { splits, writer, coordinator, processor: None, scorer: None, tracking: None, pad_inputs: false }
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
    pub fn with_tracking(mut self, tracking: MetricTracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Pull padded batches; partitioned layouts need a full global batch.
    #[must_use]
    pub fn with_padded_inputs(mut self, pad: bool) -> Self {
        self.pad_inputs = pad;
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    #[must_use]
    pub fn split_names(&self) -> Vec<String> {
        self.splits.iter().map(|s| s.name().to_string()).collect()
    }

    /// Decodes every split whose outputs for this step don't exist yet.
    pub async fn run_one_step(&mut self, state: &ModelState, rng_seed: u64) -> EvalResult<DecodePassMetrics> {
        let mode = EvaluationMode::Decode;
        let step = state.step();
        let layout = self.writer.layout().clone();
        let coordinator = self.coordinator.as_ref();
        let is_leader = coordinator.is_leader();
        let started = Instant::now();
        let mut total_steps = 0;
        let mut pass = DecodePassMetrics { split_names: self.split_names(), ..DecodePassMetrics::default() };

        for split in &mut self.splits {
            let name = split.name().to_string();
            if can_load_written_outputs(&layout, coordinator, &name, mode, step).await? {
                info!(split = %name, step, "decode outputs already exist; skipping");
                pass.outcomes.push(None);
                continue;
            }
            info!(split = %name, step, budget = split.budget, "starting decode");

            let mut decode_scalars = MeanMetrics::new();
            let mut processed_scalars = MeanMetrics::new();
            let mut decode_tree = MetricTree::new();
            let mut processed_tree = MetricTree::new();
            let mut processed = Vec::new();
            let mut summaries: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
            let processor = self.processor.as_deref();
            let steps = drive_split(split, state, rng_seed, coordinator, mode, self.pad_inputs, |_, out| {
                decode_scalars.store(&out.weighted_scalars);
                decode_tree.absorb(out.metrics)?;
                for (key, tensor) in out.summaries {
                    summaries.entry(key).or_default().push(tensor);
                }
                if !is_leader {
                    return Ok(());
                }
                match processor {
                    Some(p) => {
                        let result = p.process_decode_out(&name, &out.per_example)?;
                        processed_scalars.store(&result.weighted_scalars);
                        processed.extend(result.records);
                        if let Some(updates) = result.metric_updates {
                            processed_tree.absorb(updates)?;
                        }
                    }
                    None => processed.extend(out.per_example),
                }
                Ok(())
            })
            .await?;
            total_steps += steps;

            let out_dir = layout.output_dir(mode, &name);
            let scoring_metrics = match &self.scorer {
                Some(scorer) if is_leader && scorer.should_score(&name) => {
                    scorer.score(&name, &processed, split.sink.as_ref(), step, &out_dir)?
                }
                _ => None,
            };

            let metrics = update_float_dict(decode_scalars.summarize(step, "decode_metrics"), decode_tree.summarize());
            let processed_metrics = update_float_dict(
                processed_scalars.summarize(step, "process_decode_metrics"),
                processed_tree.summarize(),
            );
            split.sink.write(step, None, &metrics, &stack_summaries(summaries)?)?;
            if !processed_metrics.is_empty() {
                split.sink.write(step, None, &processed_metrics, &SummaryTensors::new())?;
            }
            self.writer.write(mode, &name, step, &processed)?;
            info!(split = %name, step, steps, outputs = processed.len(), "finished decode");

            if let Some(tracking) = &self.tracking {
                if is_leader {
                    find_and_maybe_update_tracked_metric(
                        &layout,
                        &tracking.metric,
                        &name,
                        state,
                        &[&metrics, &processed_metrics],
                        tracking.store.as_ref(),
                        tracking.enable_checkpoint_saving,
                    )
                    .await?;
                }
            }

            pass.outcomes.push(Some(DecodeRunOutcome { metrics, processed_metrics, scoring_metrics, steps_performed: steps }));
        }

        pass.steps_per_sec = steps_per_sec(total_steps, started.elapsed());
        info!(step, steps_per_sec = pass.steps_per_sec, "decode pass done");
        Ok(pass)
    }
}
