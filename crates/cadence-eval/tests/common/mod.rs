//! Shared fakes for cadence-eval integration tests.
//!
//! Inputs, step functions and sinks here are deterministic and count their
//! calls so tests can assert on how the loop drove them.

#![allow(dead_code)]

use cadence_abstraction::{
    Batch, CollaboratorError, InputError, InputPipeline, PerExampleRecord, ShapeTree, Tensor, TensorTree,
};
use cadence_eval::{
    CheckpointStore, DecodeProcessor, DeviceValues, FloatMetrics, FsCheckpointStore, ModelState, ProcessedDecode,
    Scorer, StateMetadata, StepFunction, StepOutput, SummarySink, SummaryTensors, TrainState, WeightedScalars,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Call counters shared between a [`VecInput`] and the test.
#[derive(Debug, Default)]
pub struct InputCounters {
    pub get_next: AtomicUsize,
    pub padded: AtomicUsize,
    pub resets: AtomicUsize,
}

impl InputCounters {
    pub fn get_next_calls(&self) -> usize {
        self.get_next.load(Ordering::SeqCst)
    }

    pub fn padded_calls(&self) -> usize {
        self.padded.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

/// A split of `num_batches` batches of `batch_size` examples each. Example
/// ids are globally numbered through the `id` feature.
pub struct VecInput {
    name: String,
    batches: Vec<Batch>,
    cursor: usize,
    batch_size: usize,
    counters: Arc<InputCounters>,
}

impl VecInput {
    pub fn new(name: &str, num_batches: usize, batch_size: usize) -> (Self, Arc<InputCounters>) {
        let batches = (0..num_batches)
            .map(|b| {
                let ids = (0..batch_size).map(|i| (b * batch_size + i) as f32).collect();
                Batch::new(batch_size).with_feature("id", Tensor::vector(ids))
            })
            .collect();
        let counters = Arc::new(InputCounters::default());
        let input = Self { name: name.to_string(), batches, cursor: 0, batch_size, counters: Arc::clone(&counters) };
        (input, counters)
    }

    pub fn boxed(name: &str, num_batches: usize, batch_size: usize) -> (Box<dyn InputPipeline>, Arc<InputCounters>) {
        let (input, counters) = Self::new(name, num_batches, batch_size);
        (Box::new(input), counters)
    }
}

impl InputPipeline for VecInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_next(&mut self) -> Result<Batch, InputError> {
        self.counters.get_next.fetch_add(1, Ordering::SeqCst);
        let batch = self.batches.get(self.cursor).cloned().ok_or(InputError::OutOfRange)?;
        self.cursor += 1;
        Ok(batch)
    }

    /// Batches are always full, so padding only shows up in the counters.
    fn get_next_padded(&mut self) -> Result<Batch, InputError> {
        self.counters.padded.fetch_add(1, Ordering::SeqCst);
        self.get_next()
    }

    fn reset(&mut self) -> Result<(), CollaboratorError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        self.cursor = 0;
        Ok(())
    }

    fn global_batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Step function that scores every example as correct when its id is even
/// and counts its own invocations.
#[derive(Debug, Default)]
pub struct ParityStep {
    pub calls: AtomicUsize,
}

impl ParityStep {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepFunction for ParityStep {
    fn call(
        &self,
        state: &ModelState,
        _rng_seed: u64,
        batch: &Batch,
        _global_batch_size: usize,
    ) -> Result<StepOutput, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ids = batch
            .features
            .get("id")
            .ok_or_else(|| CollaboratorError::Step("batch has no id feature".to_string()))?;
        let even = ids.values().iter().filter(|v| (**v as u64) % 2 == 0).count();
        let n = batch.num_examples as f64;
        let records = ids
            .values()
            .iter()
            .map(|v| {
                PerExampleRecord::new(
                    format!("{}", *v as u64),
                    serde_json::json!({ "step": state.step(), "prediction": (*v as u64) % 2 }),
                )
            })
            .collect();
        let scalars = WeightedScalars::new().with("accuracy", even as f64 / n, n);
        let summaries = SummaryTensors::from([("batch_size".to_string(), Tensor::scalar(n as f32))]);
        Ok(StepOutput::on_host(scalars, records)
            .with_loss(DeviceValues::Host(0.5))
            .with_summaries(DeviceValues::Host(summaries)))
    }
}

/// Decode post-processor reporting a word error rate that depends on the
/// model step: `1 / (1 + step / 100)`.
#[derive(Debug, Default)]
pub struct StepWerProcessor;

impl DecodeProcessor for StepWerProcessor {
    fn process_decode_out(&self, _split: &str, outputs: &[PerExampleRecord]) -> Result<ProcessedDecode, CollaboratorError> {
        let step = outputs.first().and_then(|r| r.payload["step"].as_u64()).unwrap_or(0);
        let wer = 1.0 / (1.0 + step as f64 / 100.0);
        Ok(ProcessedDecode {
            weighted_scalars: WeightedScalars::new().with("wer", wer, outputs.len() as f64),
            records: outputs.to_vec(),
            metric_updates: None,
        })
    }
}

/// Summary sink that keeps every write in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub writes: Mutex<Vec<(u64, Option<f64>, FloatMetrics)>>,
}

impl RecordingSink {
    pub fn writes(&self) -> Vec<(u64, Option<f64>, FloatMetrics)> {
        self.writes.lock().unwrap().clone()
    }
}

impl SummarySink for RecordingSink {
    fn write(
        &self,
        step: u64,
        loss: Option<f64>,
        metrics: &FloatMetrics,
        _tensors: &SummaryTensors,
    ) -> Result<(), CollaboratorError> {
        self.writes.lock().unwrap().push((step, loss, metrics.clone()));
        Ok(())
    }
}

/// Scorer for the named splits; reports how many records it saw.
#[derive(Debug, Default)]
pub struct RecordingScorer {
    pub splits: Vec<String>,
    pub calls: Mutex<Vec<(String, u64, usize, PathBuf)>>,
}

impl RecordingScorer {
    pub fn for_splits(splits: &[&str]) -> Self {
        Self { splits: splits.iter().map(|s| (*s).to_string()).collect(), calls: Mutex::default() }
    }

    pub fn calls(&self) -> Vec<(String, u64, usize, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Scorer for RecordingScorer {
    fn should_score(&self, split: &str) -> bool {
        self.splits.iter().any(|s| s == split)
    }

    fn score(
        &self,
        split: &str,
        records: &[PerExampleRecord],
        _sink: &dyn SummarySink,
        step: u64,
        out_dir: &Path,
    ) -> Result<Option<FloatMetrics>, CollaboratorError> {
        self.calls.lock().unwrap().push((split.to_string(), step, records.len(), out_dir.to_path_buf()));
        Ok(Some(FloatMetrics::from([("num_scored".to_string(), records.len() as f64)])))
    }
}

pub fn metadata() -> StateMetadata {
    StateMetadata::new(
        ShapeTree::Node(BTreeMap::from([("w".to_string(), ShapeTree::Leaf(vec![4]))])),
        None,
    )
}

pub fn train_state(step: u64) -> TrainState {
    let params = TensorTree::node([("w", TensorTree::Leaf(Tensor::vector(vec![step as f32; 4])))]);
    TrainState::new(step, params, None)
}

pub async fn save_checkpoint(dir: &Path, step: u64) {
    FsCheckpointStore::new().save(&train_state(step), dir).await.unwrap();
}
