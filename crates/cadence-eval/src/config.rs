//! Evaluation job configuration.
//!
//! Configuration is a TOML document; every field except `job_dir` has a
//! default. Example:
//!
//! ```toml
//! job_dir = "/jobs/lm-small"
//! continuous = true
//! save_interval_steps = 1000
//! num_train_steps = 100000
//!
//! [[eval_splits]]
//! name = "validation"
//! reset_for_eval = true
//!
//! [tracked_metric]
//! name = "wer"
//! mode = "min"
//! ```

use crate::error::{EvalError, EvalResult};
use crate::state::PartitionSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Direction in which a tracked metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackMode {
    Min,
    Max,
}

impl TrackMode {
    /// Whether `candidate` strictly improves on `best`.
    #[must_use]
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        match self {
            Self::Min => candidate < best,
            Self::Max => candidate > best,
        }
    }

    /// Value that any finite metric improves on.
    #[must_use]
    pub fn initial_value(self) -> f64 {
        match self {
            Self::Min => f64::MAX,
            Self::Max => -f64::MAX,
        }
    }
}

impl fmt::Display for TrackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
        }
    }
}

/// Which decode metric to track, and in which direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMetricConfig {
    /// Metric key as it appears in the decode metrics, e.g. `"wer"`.
    pub name: String,
    pub mode: Option<TrackMode>,
}

/// One dataset split to evaluate or decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    pub name: String,
    /// Fixed number of batches per checkpoint.
    #[serde(default)]
    pub eval_loop_num_batches: u64,
    /// Run until exhausted, then rewind. Overrides `eval_loop_num_batches`.
    #[serde(default)]
    pub reset_for_eval: bool,
}

impl SplitConfig {
    #[must_use]
    pub fn fixed(name: impl Into<String>, num_batches: u64) -> Self {
        Self { name: name.into(), eval_loop_num_batches: num_batches, reset_for_eval: false }
    }

    #[must_use]
    pub fn until_exhausted(name: impl Into<String>) -> Self {
        Self { name: name.into(), eval_loop_num_batches: 0, reset_for_eval: true }
    }

    /// Step budget: `-1` runs until exhaustion, otherwise the fixed count.
    #[must_use]
    pub fn budget(&self) -> i64 {
        if self.reset_for_eval { -1 } else { self.eval_loop_num_batches as i64 }
    }
}

/// Root configuration for an evaluation or decode job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Job directory; outputs, summaries and progress markers live under it.
    pub job_dir: PathBuf,

    /// Checkpoint directory. Defaults to `{job_dir}/checkpoints`.
    #[serde(default)]
    pub restore_checkpoint_dir: Option<PathBuf>,

    /// Explicit step to restore first. Resolved from the progress marker or
    /// the latest checkpoint when unset.
    #[serde(default)]
    pub restore_checkpoint_step: Option<u64>,

    /// Keep polling for new checkpoints after the first one.
    #[serde(default)]
    pub continuous: bool,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_start_wait_interval_secs")]
    pub start_wait_interval_secs: u64,

    /// In continuous mode, wait for this step before the first load.
    #[serde(default)]
    pub decode_start_after_n_steps: u64,

    #[serde(default = "default_save_interval_steps")]
    pub save_interval_steps: u64,

    #[serde(default = "default_num_train_steps")]
    pub num_train_steps: u64,

    #[serde(default = "default_random_seed")]
    pub random_seed: u64,

    /// Evaluate the EMA parameters stored in the optimizer state.
    #[serde(default)]
    pub use_ema: bool,

    #[serde(default = "default_num_devices")]
    pub num_devices: usize,

    /// Sharding rules. Selects the partitioned checkpoint gateway when set.
    #[serde(default)]
    pub partition: Option<PartitionSpec>,

    #[serde(default)]
    pub eval_splits: Vec<SplitConfig>,

    #[serde(default)]
    pub decode_splits: Vec<SplitConfig>,

    #[serde(default)]
    pub tracked_metric: Option<TrackedMetricConfig>,

    #[serde(default = "default_true")]
    pub enable_checkpoint_saving: bool,

    /// Also write each output file as a single JSON document.
    #[serde(default)]
    pub write_legacy_outputs: bool,

    /// Compute and summarize, but never write per-example outputs.
    #[serde(default)]
    pub only_aggregate_summaries: bool,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_start_wait_interval_secs() -> u64 {
    300
}

fn default_save_interval_steps() -> u64 {
    1000
}

fn default_num_train_steps() -> u64 {
    u64::MAX
}

fn default_random_seed() -> u64 {
    1234
}

fn default_num_devices() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl EvalConfig {
    /// Configuration with defaults for everything but the job directory.
    #[must_use]
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
            restore_checkpoint_dir: None,
            restore_checkpoint_step: None,
            continuous: false,
            poll_interval_secs: default_poll_interval_secs(),
            start_wait_interval_secs: default_start_wait_interval_secs(),
            decode_start_after_n_steps: 0,
            save_interval_steps: default_save_interval_steps(),
            num_train_steps: default_num_train_steps(),
            random_seed: default_random_seed(),
            use_ema: false,
            num_devices: default_num_devices(),
            partition: None,
            eval_splits: Vec::new(),
            decode_splits: Vec::new(),
            tracked_metric: None,
            enable_checkpoint_saving: true,
            write_legacy_outputs: false,
            only_aggregate_summaries: false,
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> EvalResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> EvalResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EvalError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            EvalError::Toml(e) => EvalError::InvalidConfig(format!("{}: {}", path.display(), e)),
            other => other,
        })
    }

    #[must_use]
    pub fn restore_checkpoint_dir(&self) -> PathBuf {
        self.restore_checkpoint_dir.clone().unwrap_or_else(|| self.job_dir.join("checkpoints"))
    }

    /// True when `step` is the last checkpoint training will produce.
    #[must_use]
    pub fn is_final_checkpoint(&self, step: u64) -> bool {
        step.saturating_add(self.save_interval_steps) > self.num_train_steps
    }

    pub fn validate(&self) -> EvalResult<()> {
        if self.job_dir.as_os_str().is_empty() {
            return Err(EvalError::InvalidConfig("job_dir is required".to_string()));
        }
        if self.poll_interval_secs == 0 || self.start_wait_interval_secs == 0 {
            return Err(EvalError::InvalidConfig("poll intervals must be >= 1 second".to_string()));
        }
        if self.save_interval_steps == 0 {
            return Err(EvalError::InvalidConfig("save_interval_steps must be >= 1".to_string()));
        }
        if self.num_devices == 0 {
            return Err(EvalError::InvalidConfig("num_devices must be >= 1".to_string()));
        }
        for (kind, splits) in [("eval", &self.eval_splits), ("decode", &self.decode_splits)] {
            let mut seen = HashSet::new();
            for split in splits {
                if split.name.trim().is_empty() {
                    return Err(EvalError::InvalidConfig(format!("{kind} split name must not be empty")));
                }
                if !seen.insert(split.name.as_str()) {
                    return Err(EvalError::InvalidConfig(format!(
                        "duplicate {kind} split name: {}",
                        split.name
                    )));
                }
            }
        }
        if let Some(tracked) = &self.tracked_metric {
            if tracked.mode.is_none() {
                return Err(EvalError::InvalidConfig(format!(
                    "tracked_metric.mode (min or max) must be set when tracking '{}'",
                    tracked.name
                )));
            }
        }
        if let Some(partition) = &self.partition {
            partition.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = EvalConfig::from_toml_str("job_dir = \"/tmp/job\"").unwrap();
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.restore_checkpoint_dir(), PathBuf::from("/tmp/job/checkpoints"));
        assert!(config.enable_checkpoint_saving);
        assert!(config.partition.is_none());
    }

    #[test]
    fn test_split_budget() {
        assert_eq!(SplitConfig::fixed("a", 3).budget(), 3);
        assert_eq!(SplitConfig::until_exhausted("b").budget(), -1);
    }

    #[test]
    fn test_rejects_duplicate_split_names() {
        let mut config = EvalConfig::new("/tmp/job");
        config.eval_splits = vec![SplitConfig::fixed("a", 1), SplitConfig::fixed("a", 2)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tracked_metric_requires_mode() {
        let toml = "job_dir = \"/tmp/job\"\n[tracked_metric]\nname = \"wer\"\n";
        assert!(EvalConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_final_checkpoint() {
        let mut config = EvalConfig::new("/tmp/job");
        config.save_interval_steps = 100;
        config.num_train_steps = 1000;
        assert!(!config.is_final_checkpoint(900));
        assert!(config.is_final_checkpoint(901));
        config.num_train_steps = u64::MAX;
        assert!(!config.is_final_checkpoint(u64::MAX - 1));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("eval.toml");
        std::fs::write(
            &path,
            "job_dir = \"/jobs/x\"\ncontinuous = true\n[[decode_splits]]\nname = \"test\"\nreset_for_eval = true\n[tracked_metric]\nname = \"wer\"\nmode = \"min\"\n",
        )
        .unwrap();
        let config = EvalConfig::load_from_file(&path).unwrap();
        assert!(config.continuous);
        assert_eq!(config.decode_splits[0].budget(), -1);
        assert_eq!(config.tracked_metric.unwrap().mode, Some(TrackMode::Min));
    }
}
