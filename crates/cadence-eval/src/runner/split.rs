use crate::config::SplitConfig;
use crate::contracts::{HostStepOutput, StepFunction, SummarySink};
use crate::error::{EvalError, EvalResult};
use crate::layout::EvaluationMode;
use crate::state::ModelState;
use crate::sync::HostCoordinator;
use cadence_abstraction::{InputError, InputPipeline};
use std::sync::Arc;
use tracing::{debug, info};

/// One dataset split with everything needed to run it.
pub struct SplitSpec {
    pub input: Box<dyn InputPipeline>,
    /// Batches per pass; `-1` runs until the input is exhausted.
    pub budget: i64,
    pub step_fn: Arc<dyn StepFunction>,
    pub sink: Arc<dyn SummarySink>,
}

impl SplitSpec {
    #[must_use]
    pub fn new(
        input: Box<dyn InputPipeline>,
        budget: i64,
        step_fn: Arc<dyn StepFunction>,
        sink: Arc<dyn SummarySink>,
    ) -> Self {
        Self { input, budget, step_fn, sink }
    }

    /// Binds `input` to its configured budget; the names must agree.
    pub fn from_config(
        config: &SplitConfig,
        input: Box<dyn InputPipeline>,
        step_fn: Arc<dyn StepFunction>,
        sink: Arc<dyn SummarySink>,
    ) -> EvalResult<Self> {
        if config.name != input.name() {
            return Err(EvalError::InvalidConfig(format!(
                "split '{}' is configured but the input is named '{}'",
                config.name,
                input.name()
            )));
        }
        Ok(Self::new(input, config.budget(), step_fn, sink))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.input.name()
    }
}

/// Where a split's batch loop is. Both non-running states end the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    Running,
    /// Unbudgeted input ran out; the iterator has been rewound.
    Exhausted,
    BudgetReached,
}

/// Runs the batch loop of one split, handing each reduced step output to
/// `on_batch`. Returns the number of batches consumed.
///
/// A budgeted split that runs out of data fails with
/// [`EvalError::DataExhaustedEarly`]; an unbudgeted one is rewound and ends
/// normally.
pub(crate) async fn drive_split<F>(
    split: &mut SplitSpec,
    state: &ModelState,
    rng_seed: u64,
    coordinator: &dyn HostCoordinator,
    mode: EvaluationMode,
    padded: bool,
    mut on_batch: F,
) -> EvalResult<u64>
where
    F: FnMut(u64, HostStepOutput) -> EvalResult<()> + Send,
{
    let name = split.name().to_string();
    let budget = split.budget;
    let global_batch_size = split.input.global_batch_size();
    let mut consumed: u64 = 0;
    let mut phase = SplitState::Running;

    while phase == SplitState::Running {
        if budget >= 0 && consumed >= budget.unsigned_abs() {
            phase = SplitState::BudgetReached;
            continue;
        }
        let next = if padded { split.input.get_next_padded() } else { split.input.get_next() };
        let batch = match next {
            Ok(batch) => batch,
            Err(InputError::OutOfRange) if budget >= 0 => {
                return Err(EvalError::DataExhaustedEarly { split: name, budget, consumed });
            }
            Err(InputError::OutOfRange) => {
                info!(%mode, split = %name, batches = consumed, "input exhausted; resetting");
                split.input.reset()?;
                phase = SplitState::Exhausted;
                continue;
            }
            Err(InputError::Failed(e)) => return Err(e.into()),
        };

        consumed += 1;
        let output = split.step_fn.call(state, rng_seed, &batch, global_batch_size)?;
        coordinator.barrier(&format!("{mode}_step:{name}:{consumed}")).await?;
        on_batch(consumed, output.collect()?)?;
        debug!(%mode, split = %name, step = consumed, "finished batch");
    }

    debug!(%mode, split = %name, ?phase, batches = consumed, "split finished");
    Ok(consumed)
}
