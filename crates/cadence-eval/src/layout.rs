use crate::config::TrackMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which kind of pass produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    Eval,
    Decode,
}

impl EvaluationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eval => "eval",
            Self::Decode => "decode",
        }
    }
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem layout of an evaluation job.
///
/// ```text
/// {job_dir}/{mode}_out/{split}/{mode}_out_{step}_shard_{host}
/// {job_dir}/decode_out/{split}/{metric}_{min|max}_tracker/
/// {job_dir}/summaries/{mode}_test_{split}/
/// {job_dir}/{mode}_progress.json
/// ```
#[derive(Debug, Clone)]
pub struct EvalLayout {
    job_dir: PathBuf,
}

impl EvalLayout {
    #[must_use]
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self { job_dir: job_dir.into() }
    }

    #[must_use]
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    #[must_use]
    pub fn output_base_dir(&self, mode: EvaluationMode) -> PathBuf {
        self.job_dir.join(format!("{}_out", mode.as_str()))
    }

    #[must_use]
    pub fn output_dir(&self, mode: EvaluationMode, split: &str) -> PathBuf {
        self.output_base_dir(mode).join(split)
    }

    /// The host index is part of the name even though only host 0 writes.
    #[must_use]
    pub fn output_file_name(mode: EvaluationMode, step: u64, host_index: usize) -> String {
        format!("{}_out_{}_shard_{}", mode.as_str(), step, host_index)
    }

    #[must_use]
    pub fn output_file(&self, mode: EvaluationMode, split: &str, step: u64, host_index: usize) -> PathBuf {
        self.output_dir(mode, split).join(Self::output_file_name(mode, step, host_index))
    }

    #[must_use]
    pub fn legacy_output_file(&self, mode: EvaluationMode, split: &str, step: u64, host_index: usize) -> PathBuf {
        let mut name = Self::output_file_name(mode, step, host_index);
        name.push_str(".json");
        self.output_dir(mode, split).join(name)
    }

    #[must_use]
    pub fn summary_dir(&self, mode: EvaluationMode, split: &str) -> PathBuf {
        self.job_dir.join("summaries").join(format!("{}_test_{}", mode.as_str(), split))
    }

    /// Tracker directory; `/` in metric names becomes `-`.
    #[must_use]
    pub fn tracker_dir(&self, split: &str, metric: &str, mode: TrackMode) -> PathBuf {
        self.output_dir(EvaluationMode::Decode, split)
            .join(format!("{}_{}_tracker", tracker_metric_name(metric), mode))
    }

    #[must_use]
    pub fn progress_file(&self, mode: EvaluationMode) -> PathBuf {
        self.job_dir.join(format!("{}_progress.json", mode.as_str()))
    }
}

/// Filesystem friendly form of a metric name.
#[must_use]
pub fn tracker_metric_name(metric: &str) -> String {
    metric.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_paths() {
        let layout = EvalLayout::new("/jobs/a");
        assert_eq!(
            layout.output_file(EvaluationMode::Decode, "test", 100, 0),
            PathBuf::from("/jobs/a/decode_out/test/decode_out_100_shard_0")
        );
        assert_eq!(
            layout.legacy_output_file(EvaluationMode::Eval, "dev", 7, 2),
            PathBuf::from("/jobs/a/eval_out/dev/eval_out_7_shard_2.json")
        );
    }

    #[test]
    fn test_tracker_and_summary_paths() {
        let layout = EvalLayout::new("/jobs/a");
        assert_eq!(
            layout.tracker_dir("test", "decoder/wer", TrackMode::Min),
            PathBuf::from("/jobs/a/decode_out/test/decoder-wer_min_tracker")
        );
        assert_eq!(
            layout.summary_dir(EvaluationMode::Eval, "dev"),
            PathBuf::from("/jobs/a/summaries/eval_test_dev")
        );
        assert_eq!(layout.progress_file(EvaluationMode::Decode), PathBuf::from("/jobs/a/decode_progress.json"));
    }
}
