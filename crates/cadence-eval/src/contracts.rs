//! Interfaces to the model-specific collaborators the evaluation loop drives.

use crate::device::{DeviceValues, SummaryTensors};
use crate::error::EvalResult;
use crate::metrics::{FloatMetrics, MetricTree, WeightedScalars};
use crate::runner::{DecodePassMetrics, EvalPassMetrics};
use crate::state::ModelState;
use cadence_abstraction::{Batch, CollaboratorError, PerExampleRecord};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// What one step function call produces, still on the devices.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Eval loss. Decode steps leave it unset.
    pub loss: Option<DeviceValues<f32>>,
    pub weighted_scalars: DeviceValues<WeightedScalars>,
    pub per_example: DeviceValues<Vec<PerExampleRecord>>,
    pub summaries: DeviceValues<SummaryTensors>,
    pub metrics: DeviceValues<MetricTree>,
}

impl StepOutput {
    /// Output already reduced on the host.
    #[must_use]
    pub fn on_host(weighted_scalars: WeightedScalars, per_example: Vec<PerExampleRecord>) -> Self {
        Self {
            weighted_scalars: DeviceValues::Host(weighted_scalars),
            per_example: DeviceValues::Host(per_example),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_loss(mut self, loss: DeviceValues<f32>) -> Self {
        self.loss = Some(loss);
        self
    }

    #[must_use]
    pub fn with_summaries(mut self, summaries: DeviceValues<SummaryTensors>) -> Self {
        self.summaries = summaries;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: DeviceValues<MetricTree>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Reduces every per-device part to its host value.
    pub fn collect(self) -> EvalResult<HostStepOutput> {
        Ok(HostStepOutput {
            loss: self.loss.map(DeviceValues::into_host).transpose()?,
            weighted_scalars: self.weighted_scalars.into_host()?,
            per_example: self.per_example.into_host()?,
            summaries: self.summaries.into_host()?,
            metrics: self.metrics.into_host()?,
        })
    }
}

/// A [`StepOutput`] after the cross-device reduction.
#[derive(Debug, Clone, Default)]
pub struct HostStepOutput {
    pub loss: Option<f32>,
    pub weighted_scalars: WeightedScalars,
    pub per_example: Vec<PerExampleRecord>,
    pub summaries: SummaryTensors,
    pub metrics: MetricTree,
}

/// The compiled eval or decode computation for one split.
pub trait StepFunction: Send + Sync {
    fn call(
        &self,
        state: &ModelState,
        rng_seed: u64,
        batch: &Batch,
        global_batch_size: usize,
    ) -> Result<StepOutput, CollaboratorError>;
}

impl<F> StepFunction for F
where
    F: Fn(&ModelState, u64, &Batch, usize) -> Result<StepOutput, CollaboratorError> + Send + Sync,
{
    fn call(
        &self,
        state: &ModelState,
        rng_seed: u64,
        batch: &Batch,
        global_batch_size: usize,
    ) -> Result<StepOutput, CollaboratorError> {
        self(state, rng_seed, batch, global_batch_size)
    }
}

/// Result of post-processing one batch of decode outputs.
#[derive(Debug, Clone, Default)]
pub struct ProcessedDecode {
    pub weighted_scalars: WeightedScalars,
    pub records: Vec<PerExampleRecord>,
    pub metric_updates: Option<MetricTree>,
}

/// Turns raw decode outputs into scored records. Runs on the leader only.
pub trait DecodeProcessor: Send + Sync {
    fn process_decode_out(&self, split: &str, outputs: &[PerExampleRecord]) -> Result<ProcessedDecode, CollaboratorError>;
}

/// Optional external scoring over a split's full output.
pub trait Scorer: Send + Sync {
    fn should_score(&self, split: &str) -> bool;

    fn score(
        &self,
        split: &str,
        records: &[PerExampleRecord],
        sink: &dyn SummarySink,
        step: u64,
        out_dir: &Path,
    ) -> Result<Option<FloatMetrics>, CollaboratorError>;
}

/// Destination for per-split summaries.
pub trait SummarySink: Send + Sync {
    fn write(
        &self,
        step: u64,
        loss: Option<f64>,
        metrics: &FloatMetrics,
        tensors: &SummaryTensors,
    ) -> Result<(), CollaboratorError>;
}

/// Drops every summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSummarySink;

impl SummarySink for NullSummarySink {
    fn write(&self, _: u64, _: Option<f64>, _: &FloatMetrics, _: &SummaryTensors) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    step: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    loss: Option<f64>,
    metrics: &'a FloatMetrics,
    tensors: serde_json::Map<String, serde_json::Value>,
}

/// Appends one JSON line per summary to `{dir}/summaries.jsonl`.
#[derive(Debug)]
pub struct JsonlSummarySink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSummarySink {
    pub fn new(dir: &Path) -> EvalResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { path: dir.join("summaries.jsonl"), lock: Mutex::new(()) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SummarySink for JsonlSummarySink {
    fn write(
        &self,
        step: u64,
        loss: Option<f64>,
        metrics: &FloatMetrics,
        tensors: &SummaryTensors,
    ) -> Result<(), CollaboratorError> {
        let line = SummaryLine {
            step,
            loss,
            metrics,
            tensors: tensors.iter().map(|(k, t)| (k.clone(), t.to_json())).collect(),
        };
        let mut text = serde_json::to_string(&line).map_err(|e| CollaboratorError::Summary(e.to_string()))?;
        text.push('\n');

        let _guard = self.lock.lock().map_err(|_| CollaboratorError::Summary("sink lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CollaboratorError::Summary(format!("{}: {e}", self.path.display())))?;
        file.write_all(text.as_bytes()).map_err(|e| CollaboratorError::Summary(e.to_string()))?;
        info!(step, path = %self.path.display(), metrics = metrics.len(), "wrote summary");
        Ok(())
    }
}

/// Decides, after each checkpoint, whether continuous evaluation should end.
pub trait EarlyStopping: Send + Sync {
    fn should_stop(
        &self,
        eval: Option<&EvalPassMetrics>,
        decode: Option<&DecodePassMetrics>,
        step: u64,
        is_final_checkpoint: bool,
    ) -> bool;
}

impl<F> EarlyStopping for F
where
    F: Fn(Option<&EvalPassMetrics>, Option<&DecodePassMetrics>, u64, bool) -> bool + Send + Sync,
{
    fn should_stop(
        &self,
        eval: Option<&EvalPassMetrics>,
        decode: Option<&DecodePassMetrics>,
        step: u64,
        is_final_checkpoint: bool,
    ) -> bool {
        self(eval, decode, step, is_final_checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_abstraction::Tensor;
    use tempfile::TempDir;

    #[test]
    fn test_collect_reduces_every_field() {
        let out = StepOutput::on_host(WeightedScalars::new().with("acc", 1.0, 2.0), Vec::new())
            .with_loss(DeviceValues::PerDevice(vec![1.0, 2.0]))
            .with_summaries(DeviceValues::Replicated(vec![SummaryTensors::from([(
                "attn".to_string(),
                Tensor::scalar(0.5),
            )])]));
        let host = out.collect().unwrap();
        assert_eq!(host.loss, Some(1.5));
        assert_eq!(host.weighted_scalars.get("acc").unwrap().weight, 2.0);
        assert!(host.summaries.contains_key("attn"));
        assert!(host.metrics.is_empty());
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlSummarySink::new(&temp.path().join("summaries")).unwrap();
        let metrics = FloatMetrics::from([("acc".to_string(), 0.75)]);
        sink.write(10, Some(1.25), &metrics, &SummaryTensors::new()).unwrap();
        sink.write(20, None, &metrics, &SummaryTensors::new()).unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["loss"], 1.25);
        assert!(lines[1].get("loss").is_none());
        assert_eq!(lines[1]["metrics"]["acc"], 0.75);
    }
}
