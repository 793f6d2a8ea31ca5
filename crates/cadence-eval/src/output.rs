//! Per-example output files.
//!
//! Outputs are JSON lines, one [`PerExampleRecord`] per line, written by the
//! leader only. A split is skipped for a step when its output file already
//! holds at least one record.

use crate::config::EvalConfig;
use crate::error::EvalResult;
use crate::fsutil::write_atomic;
use crate::layout::{EvalLayout, EvaluationMode};
use crate::sync::HostCoordinator;
use cadence_abstraction::PerExampleRecord;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Writes per-example outputs for one host.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    layout: EvalLayout,
    host_index: usize,
    write_legacy: bool,
    disabled: bool,
}

impl OutputWriter {
    #[must_use]
    pub fn new(layout: EvalLayout, host_index: usize) -> Self {
        Self { layout, host_index, write_legacy: false, disabled: false }
    }

    #[must_use]
    pub fn from_config(config: &EvalConfig, host_index: usize) -> Self {
        Self {
            layout: EvalLayout::new(&config.job_dir),
            host_index,
            write_legacy: config.write_legacy_outputs,
            disabled: config.only_aggregate_summaries,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &EvalLayout {
        &self.layout
    }

    /// Writes `records` for `split` at `step`. Returns the path written, or
    /// `None` on non-leader hosts and when outputs are disabled.
    pub fn write(
        &self,
        mode: EvaluationMode,
        split: &str,
        step: u64,
        records: &[PerExampleRecord],
    ) -> EvalResult<Option<PathBuf>> {
        if self.host_index != 0 || self.disabled {
            return Ok(None);
        }
        let path = self.layout.output_file(mode, split, step, self.host_index);
        let mut text = String::new();
        for record in records {
            text.push_str(&serde_json::to_string(record)?);
            text.push('\n');
        }
        write_atomic(&path, text.as_bytes())?;
        if self.write_legacy {
            let legacy = self.layout.legacy_output_file(mode, split, step, self.host_index);
            write_atomic(&legacy, &serde_json::to_vec(records)?)?;
        }
        info!(%mode, split, step, entries = records.len(), path = %path.display(), "wrote outputs");
        Ok(Some(path))
    }
}

/// Reads the records the leader wrote for `split` at `step`.
pub fn load_outputs(
    layout: &EvalLayout,
    split: &str,
    mode: EvaluationMode,
    step: u64,
) -> EvalResult<Vec<PerExampleRecord>> {
    let path = layout.output_file(mode, split, step, 0);
    let text = std::fs::read_to_string(&path)?;
    let records = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect::<Result<Vec<PerExampleRecord>, _>>()?;
    debug!(split, step, entries = records.len(), "loaded existing outputs");
    Ok(records)
}

/// Whether `split` already has non-empty outputs for `step`. The leader
/// reads the file and broadcasts the answer so every host agrees. A file
/// that fails to parse counts as not written.
pub async fn can_load_written_outputs(
    layout: &EvalLayout,
    coordinator: &dyn HostCoordinator,
    split: &str,
    mode: EvaluationMode,
    step: u64,
) -> EvalResult<bool> {
    let mut count: i64 = 0;
    if coordinator.is_leader() {
        match load_outputs(layout, split, mode, step) {
            Ok(records) => count = records.len() as i64,
            Err(e) => {
                if layout.output_file(mode, split, step, 0).exists() {
                    warn!(split, step, error = %e, "existing outputs are unreadable; running again");
                }
            }
        }
    }
    let count = coordinator.broadcast_from_leader(count).await?;
    Ok(count > 0)
}
