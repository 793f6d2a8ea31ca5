//! Checkpoint gateway: discovers checkpoint steps, waits for new ones, and
//! loads model state onto the devices in the job's state layout.

use crate::checkpoint::store::CheckpointStore;
use crate::config::EvalConfig;
use crate::device::DeviceMemory;
use crate::error::EvalResult;
use crate::state::{ModelState, PartitionSpec, StateLayout, StateMetadata, TrainState};
use crate::sync::{Clock, HostCoordinator, poll_until};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait CheckpointGateway: Send + Sync {
    /// Short name of the state layout, for logs.
    fn layout_name(&self) -> &'static str;

    /// Whether inputs should be padded to the global batch size.
    fn pads_inputs(&self) -> bool;

    /// Seed for step-function randomness on this host.
    fn rng_seed(&self) -> u64;

    /// Latest committed step, or `None` when there is no checkpoint yet.
    async fn retrieve_latest_step(&self) -> EvalResult<Option<u64>>;

    /// Blocks until a step newer than `last_step` exists and returns it.
    async fn wait_for_new_step(&self, last_step: Option<u64>) -> EvalResult<u64>;

    /// Blocks until a checkpoint at or past `start_step` exists.
    async fn wait_until_step(&self, start_step: u64) -> EvalResult<()>;

    /// Restores `step` and places it on the devices. An unresolved or
    /// missing step yields freshly initialized state.
    async fn load(&self, step: Option<u64>, metadata: &StateMetadata) -> EvalResult<ModelState>;
}

/// What every layout shares.
struct GatewayCore {
    store: Arc<dyn CheckpointStore>,
    dir: PathBuf,
    coordinator: Arc<dyn HostCoordinator>,
    clock: Arc<dyn Clock>,
    memory: DeviceMemory,
    poll_interval: Duration,
    start_wait_interval: Duration,
    seed: u64,
    use_ema: bool,
}

impl GatewayCore {
    fn new(
        config: &EvalConfig,
        store: Arc<dyn CheckpointStore>,
        coordinator: Arc<dyn HostCoordinator>,
        clock: Arc<dyn Clock>,
        memory: DeviceMemory,
    ) -> Self {
        Self {
            store,
            dir: config.restore_checkpoint_dir(),
            coordinator,
            clock,
            memory,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            start_wait_interval: Duration::from_secs(config.start_wait_interval_secs),
            seed: config.random_seed,
            use_ema: config.use_ema,
        }
    }

    async fn latest(&self) -> EvalResult<Option<u64>> {
        self.store.latest_step(&self.dir).await
    }

    async fn wait_for_new_step(&self, last_step: Option<u64>) -> EvalResult<u64> {
        let store = &self.store;
        let dir = self.dir.as_path();
        let step = poll_until(self.clock.as_ref(), self.poll_interval, "new checkpoint", move || async move {
            let latest = store.latest_step(dir).await?;
            Ok(latest.filter(|s| last_step.is_none_or(|last| *s > last)))
        })
        .await?;
        info!(step, "found new checkpoint");
        Ok(step)
    }

    async fn wait_until_step(&self, start_step: u64) -> EvalResult<()> {
        if start_step == 0 {
            return Ok(());
        }
        info!(start_step, "waiting for checkpoint before starting");
        let store = &self.store;
        let dir = self.dir.as_path();
        let reached =
            poll_until(self.clock.as_ref(), self.start_wait_interval, "start step", move || async move {
                Ok(store.latest_step(dir).await?.filter(|s| *s >= start_step))
            })
            .await?;
        info!(step = reached, start_step, "start step reached");
        Ok(())
    }

    async fn restore_or_init(&self, step: Option<u64>, metadata: &StateMetadata) -> EvalResult<TrainState> {
        if let Some(step) = step {
            if let Some(state) = self.store.restore(metadata, &self.dir, Some(step)).await? {
                info!(step, dir = %self.dir.display(), "restored checkpoint");
                return Ok(state);
            }
            warn!(step, dir = %self.dir.display(), "checkpoint not found; initializing fresh state");
        } else {
            info!(dir = %self.dir.display(), "no checkpoint step resolved; initializing fresh state");
        }
        Ok(TrainState::fresh(metadata, self.seed))
    }

    /// Eval state: EMA parameters when configured, never optimizer state.
    fn to_eval(&self, state: TrainState) -> EvalResult<TrainState> {
        if self.use_ema { state.extract_ema() } else { Ok(state.to_eval_state()) }
    }

    async fn finish(&self, state: TrainState, layout: StateLayout, layout_name: &str) -> EvalResult<ModelState> {
        let step = state.step;
        let model = ModelState::materialize(state, layout, &self.memory)?;
        self.coordinator.barrier(&format!("checkpointer:restored:{}", self.dir.display())).await?;
        info!(step, layout = layout_name, "model state ready");
        Ok(model)
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Full copy of the state on every device.
pub struct ReplicatedCheckpointer {
    core: GatewayCore,
}

impl ReplicatedCheckpointer {
    #[must_use]
    pub fn new(
        config: &EvalConfig,
        store: Arc<dyn CheckpointStore>,
        coordinator: Arc<dyn HostCoordinator>,
        clock: Arc<dyn Clock>,
        memory: DeviceMemory,
    ) -> Self {
        Self { core: GatewayCore::new(config, store, coordinator, clock, memory) }
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        self.core.dir()
    }
}

#[async_trait]
impl CheckpointGateway for ReplicatedCheckpointer {
    fn layout_name(&self) -> &'static str {
        "replicated"
    }

    fn pads_inputs(&self) -> bool {
        false
    }

    // Each host draws its own stream.
    fn rng_seed(&self) -> u64 {
        fold_in(self.core.seed, self.core.coordinator.process_index() as u64)
    }

    async fn retrieve_latest_step(&self) -> EvalResult<Option<u64>> {
        self.core.latest().await
    }

    async fn wait_for_new_step(&self, last_step: Option<u64>) -> EvalResult<u64> {
        self.core.wait_for_new_step(last_step).await
    }

    async fn wait_until_step(&self, start_step: u64) -> EvalResult<()> {
        self.core.wait_until_step(start_step).await
    }

    async fn load(&self, step: Option<u64>, metadata: &StateMetadata) -> EvalResult<ModelState> {
        // The whole checkpoint is restored, then trimmed.
        let restored = self.core.restore_or_init(step, metadata).await?;
        let state = self.core.to_eval(restored)?;
        let layout = StateLayout::Replicated { num_devices: self.core.memory.num_devices() };
        self.core.finish(state, layout, self.layout_name()).await
    }
}

/// State split across devices by a [`PartitionSpec`].
pub struct PartitionedCheckpointer {
    core: GatewayCore,
    spec: PartitionSpec,
}

impl PartitionedCheckpointer {
    #[must_use]
    pub fn new(
        config: &EvalConfig,
        spec: PartitionSpec,
        store: Arc<dyn CheckpointStore>,
        coordinator: Arc<dyn HostCoordinator>,
        clock: Arc<dyn Clock>,
        memory: DeviceMemory,
    ) -> Self {
        Self { core: GatewayCore::new(config, store, coordinator, clock, memory), spec }
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        self.core.dir()
    }
}

#[async_trait]
impl CheckpointGateway for PartitionedCheckpointer {
    fn layout_name(&self) -> &'static str {
        "partitioned"
    }

    fn pads_inputs(&self) -> bool {
        true
    }

    // One global stream shared by every host.
    fn rng_seed(&self) -> u64 {
        self.core.seed
    }

    async fn retrieve_latest_step(&self) -> EvalResult<Option<u64>> {
        self.core.latest().await
    }

    async fn wait_for_new_step(&self, last_step: Option<u64>) -> EvalResult<u64> {
        self.core.wait_for_new_step(last_step).await
    }

    async fn wait_until_step(&self, start_step: u64) -> EvalResult<()> {
        self.core.wait_until_step(start_step).await
    }

    async fn load(&self, step: Option<u64>, metadata: &StateMetadata) -> EvalResult<ModelState> {
        // Optimizer state is only read when the moving average lives there.
        let wanted = if self.core.use_ema { metadata.clone() } else { metadata.discard_opt_state() };
        let restored = self.core.restore_or_init(step, &wanted).await?;
        let state = self.core.to_eval(restored)?;
        let layout =
            StateLayout::Partitioned { num_devices: self.core.memory.num_devices(), spec: self.spec.clone() };
        self.core.finish(state, layout, self.layout_name()).await
    }
}

/// Picks the gateway for the configured layout.
#[must_use]
pub fn create_checkpointer(
    config: &EvalConfig,
    store: Arc<dyn CheckpointStore>,
    coordinator: Arc<dyn HostCoordinator>,
    clock: Arc<dyn Clock>,
    memory: DeviceMemory,
) -> Box<dyn CheckpointGateway> {
    match &config.partition {
        Some(spec) => {
            Box::new(PartitionedCheckpointer::new(config, spec.clone(), store, coordinator, clock, memory))
        }
        None => Box::new(ReplicatedCheckpointer::new(config, store, coordinator, clock, memory)),
    }
}

/// Derives an independent seed from `seed` and `data` (splitmix64 mixing).
#[must_use]
pub fn fold_in(seed: u64, data: u64) -> u64 {
    let mut z = seed ^ data.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
