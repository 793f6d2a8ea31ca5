//! Tests for assembling an evaluation job from its config.

mod common;

use cadence_eval::{
    EvalConfig, EvalError, EvalLayout, EvaluationMode, FsCheckpointStore, JobParts, JobServices, ManualClock,
    PartitionSpec, SingleHost, SplitConfig, SplitParts, StopReason, TrackMode, TrackedMetricConfig, build_eval_job,
    build_splits,
};
use common::{InputCounters, ParityStep, RecordingSink, StepWerProcessor, VecInput, metadata, save_checkpoint};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn parts(name: &str, num_batches: usize) -> (SplitParts, Arc<InputCounters>) {
    let (input, counters) = VecInput::boxed(name, num_batches, 2);
    (SplitParts::new(input, Arc::new(ParityStep::default()), Arc::new(RecordingSink::default())), counters)
}

fn services() -> JobServices {
    JobServices {
        store: Arc::new(FsCheckpointStore::new()),
        coordinator: Arc::new(SingleHost),
        clock: Arc::new(ManualClock::new()),
    }
}

#[tokio::test]
async fn test_partitioned_job_pads_decode_and_tracks_metric() {
    let temp = TempDir::new().unwrap();
    let mut config = EvalConfig::new(temp.path());
    config.num_devices = 2;
    config.partition = Some(PartitionSpec::default().with_rule("w", 0));
    config.eval_splits = vec![SplitConfig::fixed("dev", 2)];
    config.decode_splits = vec![SplitConfig::until_exhausted("test")];
    config.tracked_metric = Some(TrackedMetricConfig { name: "wer".to_string(), mode: Some(TrackMode::Min) });
    config.enable_checkpoint_saving = false;
    save_checkpoint(&config.restore_checkpoint_dir(), 100).await;

    let (eval_parts, eval_counters) = parts("dev", 3);
    let (decode_parts, decode_counters) = parts("test", 2);
    let job_parts = JobParts::default()
        .with_eval_split(eval_parts)
        .with_decode_split(decode_parts)
        .with_processor(Arc::new(StepWerProcessor));
    let job = build_eval_job(&config, job_parts, services(), metadata()).unwrap();
    assert_eq!(job.memory.num_devices(), 2);

    let report = job.eval_loop.run().await.unwrap();
    assert_eq!(report.stop_reason, StopReason::SinglePass);
    let iteration = &report.iterations[0];
    assert_eq!(iteration.eval.as_ref().unwrap().steps_performed(), vec![2]);
    assert_eq!(iteration.decode.as_ref().unwrap().get("test").unwrap().steps_performed, 2);

    // Two batches plus the pull that found the input exhausted.
    assert_eq!(decode_counters.padded_calls(), 3);
    assert_eq!(eval_counters.padded_calls(), 2);

    let tracker_dir = EvalLayout::new(temp.path()).tracker_dir("test", "wer", TrackMode::Min);
    let status: serde_json::Value =
        serde_json::from_slice(&std::fs::read(tracker_dir.join("status.json")).unwrap()).unwrap();
    assert_eq!(status["step"], 100);
    assert!(FsCheckpointStore::committed_steps(&tracker_dir).await.unwrap().is_empty());

    let stats = job.memory.stats();
    assert_eq!(stats.allocations, stats.releases);
}

#[tokio::test]
async fn test_replicated_job_decodes_unpadded() {
    let temp = TempDir::new().unwrap();
    let mut config = EvalConfig::new(temp.path());
    config.decode_splits = vec![SplitConfig::fixed("test", 1)];
    save_checkpoint(&config.restore_checkpoint_dir(), 100).await;

    let (decode_parts, counters) = parts("test", 1);
    let job = build_eval_job(&config, JobParts::default().with_decode_split(decode_parts), services(), metadata())
        .unwrap();
    job.eval_loop.run().await.unwrap();

    assert_eq!(counters.padded_calls(), 0);
    assert_eq!(counters.get_next_calls(), 1);
}

#[test]
fn test_splits_follow_config_order_and_budget() {
    let configs = vec![SplitConfig::until_exhausted("b"), SplitConfig::fixed("a", 4)];
    let available = BTreeMap::from([("a".to_string(), parts("a", 1).0), ("b".to_string(), parts("b", 1).0)]);
    let splits = build_splits(EvaluationMode::Eval, &configs, available).unwrap();
    let bound: Vec<(&str, i64)> = splits.iter().map(|s| (s.name(), s.budget)).collect();
    assert_eq!(bound, vec![("b", -1), ("a", 4)]);
}

#[test]
fn test_configured_split_without_input_is_rejected() {
    let configs = vec![SplitConfig::fixed("dev", 1)];
    let result = build_splits(EvaluationMode::Eval, &configs, BTreeMap::new());
    assert!(matches!(result, Err(EvalError::InvalidConfig(_))));
}

#[test]
fn test_input_without_configured_split_is_rejected() {
    let available = BTreeMap::from([("extra".to_string(), parts("extra", 1).0)]);
    let result = build_splits(EvaluationMode::Decode, &[], available);
    assert!(matches!(result, Err(EvalError::InvalidConfig(_))));
}

#[test]
fn test_invalid_config_is_rejected_before_building() {
    let temp = TempDir::new().unwrap();
    let mut config = EvalConfig::new(temp.path());
    config.num_devices = 0;
    let result = build_eval_job(&config, JobParts::default(), JobServices::default(), metadata());
    assert!(matches!(result, Err(EvalError::InvalidConfig(_))));
}
