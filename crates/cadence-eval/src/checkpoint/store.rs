//! Checkpoint persistence.
//!
//! On disk a checkpoint is a directory `checkpoint_{step:08}` holding
//! `params.json`, an optional `opt_state.json`, and `manifest.json`. The
//! manifest is written last and records the sha256 of every other file, so
//! a directory without one is still being written and is ignored.

use crate::error::{EvalError, EvalResult};
use crate::fsutil::{sha256_hex, write_atomic};
use crate::state::{StateMetadata, TrainState};
use async_trait::async_trait;
use cadence_abstraction::TensorTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PARAMS_FILE: &str = "params.json";
const OPT_STATE_FILE: &str = "opt_state.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Reads and writes model state checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &TrainState, dir: &Path) -> EvalResult<PathBuf>;

    /// Restores `step`, or the latest step when `None`. `Ok(None)` when no
    /// such checkpoint exists.
    async fn restore(&self, metadata: &StateMetadata, dir: &Path, step: Option<u64>) -> EvalResult<Option<TrainState>>;

    async fn latest_step(&self, dir: &Path) -> EvalResult<Option<u64>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub step: u64,
    pub created_at: DateTime<Utc>,
    pub files: Vec<CheckpointFile>,
}

/// JSON checkpoints on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsCheckpointStore {
    max_to_keep: Option<usize>,
}

impl FsCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the newest `n` checkpoints in a directory after each save.
    #[must_use]
    pub fn with_max_to_keep(mut self, n: usize) -> Self {
        self.max_to_keep = Some(n.max(1));
        self
    }

    #[must_use]
    pub fn checkpoint_dir(dir: &Path, step: u64) -> PathBuf {
        dir.join(format!("checkpoint_{step:08}"))
    }

    fn parse_step(name: &str) -> Option<u64> {
        name.strip_prefix("checkpoint_")?.parse().ok()
    }

    /// Committed steps in `dir`, ascending.
    pub async fn committed_steps(dir: &Path) -> EvalResult<Vec<u64>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut steps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(step) = name.to_str().and_then(Self::parse_step) else {
                continue;
            };
            if tokio::fs::try_exists(entry.path().join(MANIFEST_FILE)).await? {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    async fn read_verified(ckpt_dir: &Path, manifest: &CheckpointManifest, name: &str) -> EvalResult<Vec<u8>> {
        let step = manifest.step;
        let entry = manifest.files.iter().find(|f| f.name == name).ok_or_else(|| EvalError::CheckpointCorrupt {
            step,
            reason: format!("manifest does not list {name}"),
        })?;
        let bytes = tokio::fs::read(ckpt_dir.join(name)).await.map_err(|e| EvalError::CheckpointCorrupt {
            step,
            reason: format!("cannot read {name}: {e}"),
        })?;
        if sha256_hex(&bytes) != entry.sha256 {
            return Err(EvalError::CheckpointCorrupt { step, reason: format!("sha256 mismatch for {name}") });
        }
        Ok(bytes)
    }

    async fn prune(&self, dir: &Path) -> EvalResult<()> {
        let Some(keep) = self.max_to_keep else {
            return Ok(());
        };
        let steps = Self::committed_steps(dir).await?;
        let excess = steps.len().saturating_sub(keep);
        for step in &steps[..excess] {
            tokio::fs::remove_dir_all(Self::checkpoint_dir(dir, *step)).await?;
            debug!(step, dir = %dir.display(), "removed old checkpoint");
        }
        Ok(())
    }
}

fn corrupt_json(step: u64, name: &str, e: &serde_json::Error) -> EvalError {
    EvalError::CheckpointCorrupt { step, reason: format!("{name} is not valid: {e}") }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn save(&self, state: &TrainState, dir: &Path) -> EvalResult<PathBuf> {
        let ckpt_dir = Self::checkpoint_dir(dir, state.step);
        tokio::fs::create_dir_all(&ckpt_dir).await?;

        let mut files = Vec::new();
        let mut payloads = vec![(PARAMS_FILE, serde_json::to_vec(&state.params)?)];
        if let Some(opt) = &state.opt_state {
            payloads.push((OPT_STATE_FILE, serde_json::to_vec(opt)?));
        }
        for (name, bytes) in payloads {
            write_atomic(&ckpt_dir.join(name), &bytes)?;
            files.push(CheckpointFile { name: name.to_string(), sha256: sha256_hex(&bytes) });
        }
        let manifest = CheckpointManifest { step: state.step, created_at: Utc::now(), files };
        write_atomic(&ckpt_dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
        info!(step = state.step, path = %ckpt_dir.display(), "saved checkpoint");

        self.prune(dir).await?;
        Ok(ckpt_dir)
    }

    async fn restore(&self, metadata: &StateMetadata, dir: &Path, step: Option<u64>) -> EvalResult<Option<TrainState>> {
        let step = match step {
            Some(step) => step,
            None => match self.latest_step(dir).await? {
                Some(step) => step,
                None => return Ok(None),
            },
        };
        let ckpt_dir = Self::checkpoint_dir(dir, step);
        if !tokio::fs::try_exists(&ckpt_dir).await? {
            return Ok(None);
        }

        let manifest_bytes = tokio::fs::read(ckpt_dir.join(MANIFEST_FILE)).await.map_err(|e| {
            EvalError::CheckpointCorrupt { step, reason: format!("missing manifest: {e}") }
        })?;
        let manifest: CheckpointManifest =
            serde_json::from_slice(&manifest_bytes).map_err(|e| corrupt_json(step, MANIFEST_FILE, &e))?;
        if manifest.step != step {
            return Err(EvalError::CheckpointCorrupt {
                step,
                reason: format!("manifest records step {}", manifest.step),
            });
        }

        let params_bytes = Self::read_verified(&ckpt_dir, &manifest, PARAMS_FILE).await?;
        let params: TensorTree =
            serde_json::from_slice(&params_bytes).map_err(|e| corrupt_json(step, PARAMS_FILE, &e))?;

        let opt_state = if metadata.opt_shapes.is_some() {
            let bytes = Self::read_verified(&ckpt_dir, &manifest, OPT_STATE_FILE).await?;
            Some(serde_json::from_slice::<TensorTree>(&bytes).map_err(|e| corrupt_json(step, OPT_STATE_FILE, &e))?)
        } else {
            None
        };

        let state = TrainState::new(step, params, opt_state);
        if !state.matches(metadata) {
            return Err(EvalError::CheckpointCorrupt {
                step,
                reason: "restored shapes do not match the expected state".to_string(),
            });
        }
        debug!(step, path = %ckpt_dir.display(), "restored checkpoint");
        Ok(Some(state))
    }

    async fn latest_step(&self, dir: &Path) -> EvalResult<Option<u64>> {
        Ok(Self::committed_steps(dir).await?.last().copied())
    }
}
