//! Best-value tracking for one decode metric per split.
//!
//! The tracker directory holds `status.json` with the best value seen so
//! far and, when checkpoint saving is enabled, the checkpoint that produced
//! it. The status file is replaced atomically, so a reader never sees a
//! partial update.

use crate::checkpoint::CheckpointStore;
use crate::config::{TrackMode, TrackedMetricConfig};
use crate::error::{EvalError, EvalResult};
use crate::fsutil::write_atomic;
use crate::layout::{EvalLayout, tracker_metric_name};
use crate::metrics::{FloatMetrics, find_metric};
use crate::state::ModelState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMetric {
    pub metric_name: String,
    pub partition_name: String,
    pub best_value: f64,
    #[serde(default)]
    pub step: Option<u64>,
}

/// Persistent best value of one metric on one split.
#[derive(Debug)]
pub struct MetricTracker {
    dir: PathBuf,
    mode: TrackMode,
    record: TrackedMetric,
}

impl MetricTracker {
    /// Opens the tracker in `dir`, creating it on first use.
    pub fn open(dir: &Path, metric_name: &str, partition_name: &str, mode: TrackMode) -> EvalResult<Self> {
        std::fs::create_dir_all(dir)?;
        let status = dir.join(STATUS_FILE);
        let record = if status.exists() {
            let record: TrackedMetric = serde_json::from_slice(&std::fs::read(&status)?)?;
            if record.metric_name != metric_name || record.partition_name != partition_name {
                return Err(EvalError::InvalidConfig(format!(
                    "tracker at {} belongs to '{}' on '{}'",
                    dir.display(),
                    record.metric_name,
                    record.partition_name
                )));
            }
            record
        } else {
            TrackedMetric {
                metric_name: metric_name.to_string(),
                partition_name: partition_name.to_string(),
                best_value: mode.initial_value(),
                step: None,
            }
        };
        Ok(Self { dir: dir.to_path_buf(), mode, record })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn best_value(&self) -> f64 {
        self.record.best_value
    }

    #[must_use]
    pub fn record(&self) -> &TrackedMetric {
        &self.record
    }

    /// Records `value` at `step` if it strictly improves on the best value.
    pub fn update(&mut self, step: u64, value: f64) -> EvalResult<TrackerUpdate> {
        if !self.mode.improves(value, self.record.best_value) {
            return Ok(TrackerUpdate::Unchanged);
        }
        let outcome = match self.record.step {
            None => TrackerUpdate::First,
            Some(_) => TrackerUpdate::Improved { previous: self.record.best_value },
        };
        let next = TrackedMetric { best_value: value, step: Some(step), ..self.record.clone() };
        write_atomic(&self.dir.join(STATUS_FILE), &serde_json::to_vec_pretty(&next)?)?;
        self.record = next;
        Ok(outcome)
    }
}

/// Effect of one [`MetricTracker::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerUpdate {
    /// First value ever recorded.
    First,
    /// Replaced a previously recorded best value.
    Improved { previous: f64 },
    Unchanged,
}

impl TrackerUpdate {
    /// Whether the value was recorded.
    #[must_use]
    pub fn recorded(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Looks up the tracked metric for `split` in `metrics` and, when it
/// improves, records it and saves `state` next to the tracker.
///
/// The saved checkpoint holds the evaluation state, so it carries no
/// optimizer state unless the evaluation state kept it; it is meant for
/// serving, not for resuming training. A missing metric is logged and
/// skipped. Returns whether the value was recorded.
pub async fn find_and_maybe_update_tracked_metric(
    layout: &EvalLayout,
    tracked: &TrackedMetricConfig,
    split: &str,
    state: &ModelState,
    metrics: &[&FloatMetrics],
    store: &dyn CheckpointStore,
    enable_checkpoint_saving: bool,
) -> EvalResult<bool> {
    let mode = tracked.mode.ok_or_else(|| {
        EvalError::InvalidConfig(format!("tracked metric '{}' has no mode", tracked.name))
    })?;
    let Some(value) = find_metric(metrics, &tracked.name) else {
        let err = EvalError::MissingTrackedMetric { metric: tracked.name.clone(), split: split.to_string() };
        warn!(error = %err, "skipping metric tracking");
        return Ok(false);
    };

    let dir = layout.tracker_dir(split, &tracked.name, mode);
    let mut tracker = MetricTracker::open(&dir, &tracker_metric_name(&tracked.name), split, mode)?;
    let outcome = tracker.update(state.step(), value)?;
    if !outcome.recorded() {
        return Ok(false);
    }
    info!(metric = %tracked.name, split, step = state.step(), value, ?outcome, "updating tracked metric and checkpoint");
    if enable_checkpoint_saving {
        let snapshot = state.unreplicate();
        if snapshot.opt_state.is_none() {
            warn!(step = snapshot.step, "saving best checkpoint without optimizer state");
        }
        store.save(&snapshot, tracker.dir()).await?;
    }
    Ok(true)
}
