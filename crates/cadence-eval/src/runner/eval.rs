use super::split::{SplitSpec, drive_split};
use super::{EvalPassMetrics, EvalRunOutcome, stack_summaries, steps_per_sec};
use crate::contracts::Scorer;
use crate::error::EvalResult;
use crate::layout::EvaluationMode;
use crate::metrics::{MeanMetrics, MetricTree, update_float_dict};
use crate::output::{OutputWriter, can_load_written_outputs};
use crate::state::ModelState;
use crate::sync::HostCoordinator;
use cadence_abstraction::Tensor;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Runs every eval split against one model state.
pub struct EvalRunner {
    splits: Vec<SplitSpec>,
    writer: OutputWriter,
    coordinator: Arc<dyn HostCoordinator>,
    scorer: Option<Arc<dyn Scorer>>,
}

impl EvalRunner {
    #[must_use]
    pub fn new(splits: Vec<SplitSpec>, writer: OutputWriter, coordinator: Arc<dyn HostCoordinator>) -> Self {
        Self { splits, writer, coordinator, scorer: None }
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
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

    /// Evaluates every split whose outputs for this step don't exist yet.
    pub async fn run_one_step(&mut self, state: &ModelState, rng_seed: u64) -> EvalResult<EvalPassMetrics> {
        let mode = EvaluationMode::Eval;
        let step = state.step();
        let layout = self.writer.layout().clone();
        let coordinator = self.coordinator.as_ref();
        let started = Instant::now();
        let mut total_steps = 0;
        let mut pass = EvalPassMetrics { split_names: self.split_names(), ..EvalPassMetrics::default() };

        for split in &mut self.splits {
            let name = split.name().to_string();
            if can_load_written_outputs(&layout, coordinator, &name, mode, step).await? {
                info!(split = %name, step, "eval outputs already exist; skipping");
                pass.outcomes.push(None);
                continue;
            }
            info!(split = %name, step, budget = split.budget, "starting eval");

            let mut losses: Vec<f32> = Vec::new();
            let mut scalars = MeanMetrics::new();
            let mut tree = MetricTree::new();
            let mut records = Vec::new();
            let mut summaries: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();
            let steps = drive_split(split, state, rng_seed, coordinator, mode, true, |_, out| {
                losses.extend(out.loss);
                scalars.store(&out.weighted_scalars);
                tree.absorb(out.metrics)?;
                records.extend(out.per_example);
                for (key, tensor) in out.summaries {
                    summaries.entry(key).or_default().push(tensor);
                }
                Ok(())
            })
            .await?;
            total_steps += steps;

            // Mean over batches, not over examples.
            let loss = (!losses.is_empty())
                .then(|| losses.iter().map(|l| f64::from(*l)).sum::<f64>() / losses.len() as f64);
            let metrics = update_float_dict(scalars.summarize(step, "eval"), tree.summarize());
            let tensors = stack_summaries(summaries)?;
            info!(split = %name, step, steps, loss = ?loss, "finished eval");

            let out_dir = layout.output_dir(mode, &name);
            let scoring_metrics = match &self.scorer {
                Some(scorer) if coordinator.is_leader() && scorer.should_score(&name) => {
                    scorer.score(&name, &records, split.sink.as_ref(), step, &out_dir)?
                }
                _ => None,
            };

            split.sink.write(step, loss, &metrics, &tensors)?;
            self.writer.write(mode, &name, step, &records)?;
            pass.outcomes.push(Some(EvalRunOutcome { metrics, scoring_metrics, steps_performed: steps, loss }));
        }

        pass.steps_per_sec = steps_per_sec(total_steps, started.elapsed());
        info!(step, steps_per_sec = pass.steps_per_sec, "eval pass done");
        Ok(pass)
    }
}
