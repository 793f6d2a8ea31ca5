//! The continuous evaluation loop.
//!
//! ```text
//! load ─▶ decode ─▶ eval ─▶ decide ─┬─▶ stop
//!   ▲                               │
//!   └──── release ◀── poll ◀────────┘
//! ```
//!
//! The loop owns its model state: it is released before polling for the
//! next checkpoint, so at most one state is ever live on the devices.

use crate::checkpoint::{CheckpointGateway, ProgressMarker, resolve_restore_step};
use crate::config::EvalConfig;
use crate::contracts::EarlyStopping;
use crate::error::EvalResult;
use crate::layout::{EvalLayout, EvaluationMode};
use crate::runner::{DecodePassMetrics, DecodeRunner, EvalPassMetrics, EvalRunner};
use crate::state::StateMetadata;
use crate::sync::HostCoordinator;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// One pass was requested.
    SinglePass,
    /// The last checkpoint training will write has been evaluated.
    FinalCheckpoint,
    EarlyStopped,
    /// No splits were configured.
    NothingToDo,
}

impl StopReason {
    /// Wire code used to share the leader's decision; 0 means keep going.
    const fn code(reason: Option<Self>) -> i64 {
        match reason {
            None => 0,
            Some(Self::SinglePass) => 1,
            Some(Self::FinalCheckpoint) => 2,
            Some(Self::EarlyStopped) => 3,
            Some(Self::NothingToDo) => 4,
        }
    }

    const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::SinglePass),
            2 => Some(Self::FinalCheckpoint),
            3 => Some(Self::EarlyStopped),
            4 => Some(Self::NothingToDo),
            _ => None,
        }
    }
}

/// What happened for one checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub step: u64,
    pub decode: Option<DecodePassMetrics>,
    pub eval: Option<EvalPassMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub iterations: Vec<IterationReport>,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RunDecode,
    RunEval,
    Decide,
    Poll,
}

/// Drives decode and eval over successive checkpoints.
pub struct EvalLoop {
    config: EvalConfig,
    layout: EvalLayout,
    gateway: Box<dyn CheckpointGateway>,
    coordinator: Arc<dyn HostCoordinator>,
    metadata: StateMetadata,
    eval: Option<EvalRunner>,
    decode: Option<DecodeRunner>,
    early_stopping: Option<Arc<dyn EarlyStopping>>,
}

impl EvalLoop {
    #[must_use]
    pub fn new(
        config: EvalConfig,
        gateway: Box<dyn CheckpointGateway>,
        coordinator: Arc<dyn HostCoordinator>,
        metadata: StateMetadata,
    ) -> Self {
        let layout = EvalLayout::new(&config.job_dir);
        Self { config, layout, gateway, coordinator, metadata, eval: None, decode: None, early_stopping: None }
    }

    #[must_use]
    pub fn with_eval(mut self, runner: EvalRunner) -> Self {
        self.eval = (!runner.is_empty()).then_some(runner);
        self
    }

    #[must_use]
    pub fn with_decode(mut self, runner: DecodeRunner) -> Self {
        self.decode = (!runner.is_empty()).then_some(runner);
        self
    }

    #[must_use]
    pub fn with_early_stopping(mut self, predicate: Arc<dyn EarlyStopping>) -> Self {
        self.early_stopping = Some(predicate);
        self
    }

    /// Mode recorded in the progress marker.
    fn mode(&self) -> EvaluationMode {
        if self.decode.is_some() { EvaluationMode::Decode } else { EvaluationMode::Eval }
    }

    /// Runs until a single pass is done, the final checkpoint has been
    /// evaluated, or early stopping fires.
    pub async fn run(mut self) -> EvalResult<LoopReport> {
        if self.eval.is_none() && self.decode.is_none() {
            info!("no eval or decode splits defined; nothing to do");
            return Ok(LoopReport { iterations: Vec::new(), stop_reason: StopReason::NothingToDo });
        }
        let mode = self.mode();
        info!(
            %mode,
            layout = self.gateway.layout_name(),
            continuous = self.config.continuous,
            "starting evaluation loop"
        );

        if self.config.continuous && self.config.decode_start_after_n_steps > 0 {
            self.gateway.wait_until_step(self.config.decode_start_after_n_steps).await?;
        }
        let restore_step = resolve_restore_step(&self.config, &self.layout, mode, self.gateway.as_ref()).await?;
        let mut state = self.gateway.load(restore_step, &self.metadata).await?;
        // Polling continues after the step actually loaded; a missing
        // checkpoint leaves fresh state with nothing to poll past.
        let mut last_step = restore_step.filter(|step| *step == state.step());
        let rng_seed = self.gateway.rng_seed();

        let mut iterations: Vec<IterationReport> = Vec::new();
        let mut current = IterationReport { step: state.step(), decode: None, eval: None };
        let mut marker = None;
        let mut phase = Phase::RunDecode;

        let stop_reason = loop {
            match phase {
                Phase::RunDecode => {
                    // Fresh state has no checkpoint step to resume from.
                    let evaluating = last_step.map(|_| state.step());
                    marker =
                        Some(ProgressMarker::begin(&self.layout, mode, evaluating, self.coordinator.is_leader())?);
                    if let Some(runner) = self.decode.as_mut() {
                        let span = info_span!("decode", step = state.step());
                        current.decode = Some(runner.run_one_step(&state, rng_seed).instrument(span).await?);
                    }
                    phase = Phase::RunEval;
                }
                Phase::RunEval => {
                    if let Some(runner) = self.eval.as_mut() {
                        let span = info_span!("eval", step = state.step());
                        current.eval = Some(runner.run_one_step(&state, rng_seed).instrument(span).await?);
                    }
                    if let Some(marker) = marker.take() {
                        marker.complete()?;
                    }
                    phase = Phase::Decide;
                }
                Phase::Decide => {
                    let finished = std::mem::replace(
                        &mut current,
                        IterationReport { step: state.step(), decode: None, eval: None },
                    );
                    let stop = self.decide(&finished, last_step).await?;
                    iterations.push(finished);
                    if let Some(reason) = stop {
                        break reason;
                    }
                    phase = Phase::Poll;
                }
                Phase::Poll => {
                    let released = state.release();
                    info!(bytes = released, "released model state; waiting for a new checkpoint");
                    let step = self.gateway.wait_for_new_step(last_step).await?;
                    last_step = Some(step);
                    state = self.gateway.load(Some(step), &self.metadata).await?;
                    current.step = state.step();
                    phase = Phase::RunDecode;
                }
            }
        };

        state.release();
        info!(?stop_reason, checkpoints = iterations.len(), "evaluation loop finished");
        Ok(LoopReport { iterations, stop_reason })
    }

    /// Stop decision shared by every host. Only the leader's processed
    /// decode metrics are complete, so its decision is broadcast and
    /// followers act on it.
    async fn decide(&self, report: &IterationReport, last_step: Option<u64>) -> EvalResult<Option<StopReason>> {
        let local = self.local_decision(report, last_step);
        let agreed = self.coordinator.broadcast_from_leader(StopReason::code(local)).await?;
        let stop = StopReason::from_code(agreed);
        if stop != local {
            info!(?local, ?stop, "following the leader's stop decision");
        }
        Ok(stop)
    }

    fn local_decision(&self, report: &IterationReport, last_step: Option<u64>) -> Option<StopReason> {
        if !self.config.continuous {
            return Some(StopReason::SinglePass);
        }
        let step = last_step?;
        let is_final = self.config.is_final_checkpoint(step);
        if let Some(predicate) = &self.early_stopping {
            if predicate.should_stop(report.eval.as_ref(), report.decode.as_ref(), step, is_final) {
                info!(step, "early stopping");
                return Some(StopReason::EarlyStopped);
            }
        }
        if is_final {
            info!(step, num_train_steps = self.config.num_train_steps, "evaluated the final checkpoint");
            return Some(StopReason::FinalCheckpoint);
        }
        None
    }
}
