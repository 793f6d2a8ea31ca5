//! Per-split evaluation and decode passes over one model state.

mod decode;
mod eval;
mod split;

pub use decode::{DecodeRunner, MetricTracking};
pub use eval::EvalRunner;
pub use split::{SplitSpec, SplitState};

use crate::device::SummaryTensors;
use crate::error::EvalResult;
use crate::metrics::FloatMetrics;
use cadence_abstraction::Tensor;
use std::collections::BTreeMap;
use std::time::Duration;

/// Result of one eval split.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRunOutcome {
    pub metrics: FloatMetrics,
    pub scoring_metrics: Option<FloatMetrics>,
    pub steps_performed: u64,
    /// Unweighted mean of the per-batch losses.
    pub loss: Option<f64>,
}

/// Result of one decode split.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRunOutcome {
    pub metrics: FloatMetrics,
    pub processed_metrics: FloatMetrics,
    pub scoring_metrics: Option<FloatMetrics>,
    pub steps_performed: u64,
}

/// One eval pass: an entry per split, `None` for splits whose outputs for
/// the step already existed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalPassMetrics {
    pub split_names: Vec<String>,
    pub outcomes: Vec<Option<EvalRunOutcome>>,
    pub steps_per_sec: f64,
}

impl EvalPassMetrics {
    /// Batches run per split; skipped splits count zero.
    #[must_use]
    pub fn steps_performed(&self) -> Vec<u64> {
        self.outcomes.iter().map(|o| o.as_ref().map_or(0, |o| o.steps_performed)).collect()
    }

    #[must_use]
    pub fn get(&self, split: &str) -> Option<&EvalRunOutcome> {
        let idx = self.split_names.iter().position(|n| n == split)?;
        self.outcomes.get(idx)?.as_ref()
    }
}

/// One decode pass, shaped like [`EvalPassMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodePassMetrics {
    pub split_names: Vec<String>,
    pub outcomes: Vec<Option<DecodeRunOutcome>>,
    pub steps_per_sec: f64,
}

impl DecodePassMetrics {
    #[must_use]
    pub fn steps_performed(&self) -> Vec<u64> {
        self.outcomes.iter().map(|o| o.as_ref().map_or(0, |o| o.steps_performed)).collect()
    }

    #[must_use]
    pub fn get(&self, split: &str) -> Option<&DecodeRunOutcome> {
        let idx = self.split_names.iter().position(|n| n == split)?;
        self.outcomes.get(idx)?.as_ref()
    }
}

fn steps_per_sec(steps: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { steps as f64 / secs } else { 0.0 }
}

/// Stacks each summary's per-batch tensors along a new leading axis.
fn stack_summaries(series: BTreeMap<String, Vec<Tensor>>) -> EvalResult<SummaryTensors> {
    series.into_iter().map(|(name, tensors)| Ok((name, Tensor::stack(&tensors)?))).collect()
}
