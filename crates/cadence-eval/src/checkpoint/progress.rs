//! Progress marker: records which checkpoint step a job is evaluating so a
//! restarted job resumes from that step instead of skipping ahead.

use crate::checkpoint::CheckpointGateway;
use crate::config::EvalConfig;
use crate::error::EvalResult;
use crate::fsutil::write_atomic;
use crate::layout::{EvalLayout, EvaluationMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub mode: EvaluationMode,
    pub step: Option<u64>,
    pub status: ProgressStatus,
    pub updated_at: DateTime<Utc>,
}

/// Marker for one checkpoint's evaluation, written on the leader only.
#[derive(Debug)]
pub struct ProgressMarker {
    path: PathBuf,
    record: ProgressRecord,
    enabled: bool,
}

impl ProgressMarker {
    /// Records that evaluation of `step` has started.
    pub fn begin(layout: &EvalLayout, mode: EvaluationMode, step: Option<u64>, is_leader: bool) -> EvalResult<Self> {
        let marker = Self {
            path: layout.progress_file(mode),
            record: ProgressRecord { mode, step, status: ProgressStatus::InProgress, updated_at: Utc::now() },
            enabled: is_leader,
        };
        marker.persist()?;
        Ok(marker)
    }

    /// Records that evaluation of the step finished.
    pub fn complete(mut self) -> EvalResult<()> {
        self.record.status = ProgressStatus::Complete;
        self.record.updated_at = Utc::now();
        self.persist()
    }

    fn persist(&self) -> EvalResult<()> {
        if self.enabled {
            write_atomic(&self.path, &serde_json::to_vec_pretty(&self.record)?)?;
        }
        Ok(())
    }
}

/// The last marker written for `mode`, if any. An unreadable marker is
/// treated as absent.
pub fn read_progress(layout: &EvalLayout, mode: EvaluationMode) -> EvalResult<Option<ProgressRecord>> {
    let path = layout.progress_file(mode);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable progress marker");
            Ok(None)
        }
    }
}

/// Step to restore first: the configured step, else the step of an
/// unfinished progress marker, else the latest checkpoint. A completed
/// marker does not pin the restart to its already evaluated step.
pub async fn resolve_restore_step(
    config: &EvalConfig,
    layout: &EvalLayout,
    mode: EvaluationMode,
    gateway: &dyn CheckpointGateway,
) -> EvalResult<Option<u64>> {
    if let Some(step) = config.restore_checkpoint_step {
        info!(step, "restoring configured checkpoint step");
        return Ok(Some(step));
    }
    match read_progress(layout, mode)? {
        Some(ProgressRecord { step: Some(step), status: ProgressStatus::InProgress, .. }) => {
            info!(step, "resuming interrupted evaluation from progress marker");
            return Ok(Some(step));
        }
        Some(ProgressRecord { step: Some(step), status: ProgressStatus::Complete, .. }) => {
            info!(step, "progress marker is complete; moving on to the latest checkpoint");
        }
        _ => {}
    }
    gateway.retrieve_latest_step().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, FsCheckpointStore, create_checkpointer};
    use crate::device::DeviceMemory;
    use crate::state::TrainState;
    use crate::sync::{ManualClock, SingleHost};
    use cadence_abstraction::{Tensor, TensorTree};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_marker_lifecycle() {
        let temp = TempDir::new().unwrap();
        let layout = EvalLayout::new(temp.path());
        let marker = ProgressMarker::begin(&layout, EvaluationMode::Decode, Some(300), true).unwrap();
        let record = read_progress(&layout, EvaluationMode::Decode).unwrap().unwrap();
        assert_eq!(record.step, Some(300));
        assert_eq!(record.status, ProgressStatus::InProgress);

        marker.complete().unwrap();
        let record = read_progress(&layout, EvaluationMode::Decode).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Complete);
        assert!(read_progress(&layout, EvaluationMode::Eval).unwrap().is_none());
    }

    #[test]
    fn test_followers_write_nothing() {
        let temp = TempDir::new().unwrap();
        let layout = EvalLayout::new(temp.path());
        ProgressMarker::begin(&layout, EvaluationMode::Eval, Some(1), false).unwrap().complete().unwrap();
        assert!(!layout.progress_file(EvaluationMode::Eval).exists());
    }

    #[test]
    fn test_garbled_marker_is_ignored() {
        let temp = TempDir::new().unwrap();
        let layout = EvalLayout::new(temp.path());
        std::fs::write(layout.progress_file(EvaluationMode::Eval), "not json").unwrap();
        assert!(read_progress(&layout, EvaluationMode::Eval).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_unfinished_marker_pins_restore_step() {
        let temp = TempDir::new().unwrap();
        let config = EvalConfig::new(temp.path());
        let layout = EvalLayout::new(temp.path());
        let store = Arc::new(FsCheckpointStore::new());
        for step in [100, 200] {
            let params = TensorTree::node([("w", TensorTree::Leaf(Tensor::vector(vec![1.0])))]);
            store.save(&TrainState::new(step, params, None), &config.restore_checkpoint_dir()).await.unwrap();
        }
        let gateway =
            create_checkpointer(&config, store, Arc::new(SingleHost), Arc::new(ManualClock::new()), DeviceMemory::new(1));
        let mode = EvaluationMode::Eval;

        assert_eq!(resolve_restore_step(&config, &layout, mode, gateway.as_ref()).await.unwrap(), Some(200));

        let marker = ProgressMarker::begin(&layout, EvaluationMode::Eval, Some(100), true).unwrap();
        assert_eq!(resolve_restore_step(&config, &layout, mode, gateway.as_ref()).await.unwrap(), Some(100));

        marker.complete().unwrap();
        assert_eq!(resolve_restore_step(&config, &layout, mode, gateway.as_ref()).await.unwrap(), Some(200));
    }
}
