//! Model state: the host-side snapshot read from checkpoints and its
//! materialized form on the devices.

use crate::device::{DeviceAllocation, DeviceMemory};
use crate::error::{EvalError, EvalResult};
use cadence_abstraction::{ShapeTree, Tensor, TensorTree};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Name of the optimizer-state subtree holding the parameter moving average.
pub const EMA_KEY: &str = "ema";

/// Sharding rules: a parameter path prefix maps to the axis split across
/// devices. Parameters without a matching rule are replicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    #[serde(default)]
    pub rules: BTreeMap<String, usize>,
}

impl PartitionSpec {
    #[must_use]
    pub fn with_rule(mut self, prefix: impl Into<String>, axis: usize) -> Self {
        self.rules.insert(prefix.into(), axis);
        self
    }

    pub fn validate(&self) -> EvalResult<()> {
        if let Some(prefix) = self.rules.keys().find(|p| p.trim_matches('/').is_empty()) {
            return Err(EvalError::InvalidConfig(format!("partition rule has an empty prefix: '{prefix}'")));
        }
        Ok(())
    }

    /// Axis for `path`, from the longest matching prefix.
    #[must_use]
    pub fn axis_for(&self, path: &str) -> Option<usize> {
        self.rules
            .iter()
            .filter(|(prefix, _)| {
                let prefix = prefix.trim_matches('/');
                path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, axis)| *axis)
    }
}

/// Shapes a restore must produce. `opt_shapes: None` means the optimizer
/// state is not needed and may be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub param_shapes: ShapeTree,
    #[serde(default)]
    pub opt_shapes: Option<ShapeTree>,
}

impl StateMetadata {
    #[must_use]
    pub fn new(param_shapes: ShapeTree, opt_shapes: Option<ShapeTree>) -> Self {
        Self { param_shapes, opt_shapes }
    }

    /// Same shapes, without the optimizer state.
    #[must_use]
    pub fn discard_opt_state(&self) -> Self {
        Self { param_shapes: self.param_shapes.clone(), opt_shapes: None }
    }
}

/// Host-side model state as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    pub params: TensorTree,
    #[serde(default)]
    pub opt_state: Option<TensorTree>,
}

impl TrainState {
    #[must_use]
    pub fn new(step: u64, params: TensorTree, opt_state: Option<TensorTree>) -> Self {
        Self { step, params, opt_state }
    }

    /// Freshly initialized step-0 state, reproducible from `seed`.
    #[must_use]
    pub fn fresh(metadata: &StateMetadata, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut init = |_: &str, shape: &[usize]| {
            let n: usize = shape.iter().product();
            (0..n).map(|_| rng.gen_range(-0.05f32..0.05)).collect::<Vec<f32>>()
        };
        let params = metadata.param_shapes.materialize(&mut init);
        let opt_state = metadata
            .opt_shapes
            .as_ref()
            .map(|shapes| shapes.materialize(&mut |_: &str, shape: &[usize]| vec![0.0; shape.iter().product()]));
        Self { step: 0, params, opt_state }
    }

    /// Drops the optimizer state; evaluation only needs parameters.
    #[must_use]
    pub fn to_eval_state(self) -> Self {
        Self { opt_state: None, ..self }
    }

    /// Replaces the parameters with their moving average from the optimizer
    /// state and drops the rest of it.
    pub fn extract_ema(self) -> EvalResult<Self> {
        let step = self.step;
        let ema = self
            .opt_state
            .as_ref()
            .and_then(find_ema)
            .cloned()
            .ok_or_else(|| EvalError::CheckpointCorrupt {
                step,
                reason: format!("no '{EMA_KEY}' entry in optimizer state"),
            })?;
        if ema.shape_tree() != self.params.shape_tree() {
            return Err(EvalError::CheckpointCorrupt {
                step,
                reason: "moving average does not match the parameter shapes".to_string(),
            });
        }
        info!(step, "using parameter moving average");
        Ok(Self { step, params: ema, opt_state: None })
    }

    /// Whether the state has the shapes `metadata` asks for.
    #[must_use]
    pub fn matches(&self, metadata: &StateMetadata) -> bool {
        if self.params.shape_tree() != metadata.param_shapes {
            return false;
        }
        match (&metadata.opt_shapes, &self.opt_state) {
            (None, _) => true,
            (Some(expected), Some(actual)) => actual.shape_tree() == *expected,
            (Some(_), None) => false,
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.params.size_bytes() + self.opt_state.as_ref().map_or(0, TensorTree::size_bytes)
    }
}

fn find_ema(tree: &TensorTree) -> Option<&TensorTree> {
    match tree {
        TensorTree::Leaf(_) => None,
        TensorTree::Node(children) => {
            children.get(EMA_KEY).or_else(|| children.values().find_map(find_ema))
        }
    }
}

/// How a state is laid out across the devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLayout {
    /// Full copy on every device.
    Replicated { num_devices: usize },
    /// Parameters split across devices by `spec`.
    Partitioned { num_devices: usize, spec: PartitionSpec },
}

impl StateLayout {
    #[must_use]
    pub fn num_devices(&self) -> usize {
        match self {
            Self::Replicated { num_devices } | Self::Partitioned { num_devices, .. } => *num_devices,
        }
    }
}

/// A model state resident on the devices. Holds the single device
/// allocation until [`ModelState::release`] is called.
#[derive(Debug)]
pub struct ModelState {
    state: TrainState,
    layout: StateLayout,
    allocation: DeviceAllocation,
}

impl ModelState {
    /// Places `state` on the devices according to `layout`.
    pub fn materialize(state: TrainState, layout: StateLayout, memory: &DeviceMemory) -> EvalResult<Self> {
        let per_device = match &layout {
            StateLayout::Replicated { .. } => state.size_bytes(),
            StateLayout::Partitioned { num_devices, spec } => {
                shard_tree(&state.params, spec, *num_devices, 0, state.step)?.size_bytes()
                    + state.opt_state.as_ref().map_or(0, TensorTree::size_bytes)
            }
        };
        let allocation = memory.allocate(state.step, per_device)?;
        debug!(step = state.step, per_device_bytes = per_device, "materialized model state");
        Ok(Self { state, layout, allocation })
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        self.state.step
    }

    #[must_use]
    pub fn params(&self) -> &TensorTree {
        &self.state.params
    }

    #[must_use]
    pub fn opt_state(&self) -> Option<&TensorTree> {
        self.state.opt_state.as_ref()
    }

    #[must_use]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Host copy of the logical state, as a checkpoint would store it.
    #[must_use]
    pub fn unreplicate(&self) -> TrainState {
        self.state.clone()
    }

    /// The parameters held by `device`.
    pub fn device_shard(&self, device: usize) -> EvalResult<TensorTree> {
        let num_devices = self.layout.num_devices();
        if device >= num_devices {
            return Err(EvalError::Other(anyhow::anyhow!("device {device} out of range for {num_devices} devices")));
        }
        match &self.layout {
            StateLayout::Replicated { .. } => Ok(self.state.params.clone()),
            StateLayout::Partitioned { spec, .. } => {
                shard_tree(&self.state.params, spec, num_devices, device, self.state.step)
            }
        }
    }

    /// Frees the device memory held by this state.
    pub fn release(self) -> usize {
        let step = self.state.step;
        let bytes = self.allocation.release();
        debug!(step, bytes, "released model state");
        bytes
    }
}

fn shard_tree(
    params: &TensorTree,
    spec: &PartitionSpec,
    num_devices: usize,
    device: usize,
    step: u64,
) -> EvalResult<TensorTree> {
    params.try_map_leaves(&mut |path: &str, tensor: &Tensor| {
        let Some(axis) = spec.axis_for(path) else {
            return Ok(tensor.clone());
        };
        let dim = tensor.shape().get(axis).copied().ok_or_else(|| EvalError::CheckpointCorrupt {
            step,
            reason: format!("'{path}' has rank {} but is partitioned on axis {axis}", tensor.rank()),
        })?;
        if dim % num_devices != 0 {
            return Err(EvalError::CheckpointCorrupt {
                step,
                reason: format!("'{path}' axis {axis} of size {dim} does not split over {num_devices} devices"),
            });
        }
        let len = dim / num_devices;
        Ok(tensor.slice_axis(axis, device * len, len)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> StateMetadata {
        StateMetadata::new(
            ShapeTree::Node(BTreeMap::from([
                ("dense".to_string(), ShapeTree::Leaf(vec![4, 2])),
                ("bias".to_string(), ShapeTree::Leaf(vec![2])),
            ])),
            None,
        )
    }

    #[test]
    fn test_fresh_state_is_reproducible() {
        let a = TrainState::fresh(&metadata(), 7);
        let b = TrainState::fresh(&metadata(), 7);
        let c = TrainState::fresh(&metadata(), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.step, 0);
        assert!(a.matches(&metadata()));
    }

    #[test]
    fn test_extract_ema_replaces_params() {
        let params = TensorTree::node([("w", TensorTree::Leaf(Tensor::vector(vec![1.0, 2.0])))]);
        let ema = TensorTree::node([("w", TensorTree::Leaf(Tensor::vector(vec![0.5, 0.5])))]);
        let opt = TensorTree::node([("adam", TensorTree::node([(EMA_KEY, ema.clone())]))]);
        let state = TrainState::new(3, params.clone(), Some(opt)).extract_ema().unwrap();
        assert_eq!(state.params, ema);
        assert!(state.opt_state.is_none());

        let missing = TrainState::new(3, params, None).extract_ema();
        assert!(matches!(missing, Err(EvalError::CheckpointCorrupt { step: 3, .. })));
    }

    #[test]
    fn test_partition_rules_pick_longest_prefix() {
        let spec = PartitionSpec::default().with_rule("encoder", 0).with_rule("encoder/dense", 1);
        assert_eq!(spec.axis_for("encoder/dense/kernel"), Some(1));
        assert_eq!(spec.axis_for("encoder/bias"), Some(0));
        assert_eq!(spec.axis_for("encoderx/bias"), None);
        assert!(PartitionSpec::default().with_rule("/", 0).validate().is_err());
    }

    #[test]
    fn test_partitioned_shards_split_the_axis() {
        let memory = DeviceMemory::new(2);
        let state = TrainState::fresh(&metadata(), 1);
        let dense = state.params.get("dense").cloned();
        let layout = StateLayout::Partitioned { num_devices: 2, spec: PartitionSpec::default().with_rule("dense", 0) };
        let model = ModelState::materialize(state, layout, &memory).unwrap();

        let shard = model.device_shard(1).unwrap();
        let Some(TensorTree::Leaf(full)) = dense else { panic!("dense missing") };
        let Some(TensorTree::Leaf(part)) = shard.get("dense") else { panic!("shard missing") };
        assert_eq!(part.shape(), &[2, 2]);
        assert_eq!(part.values(), &full.values()[4..]);
        assert_eq!(shard.get("bias").and_then(|b| b.leaves().first().map(|(_, t)| t.shape().to_vec())), Some(vec![2]));
        assert!(model.device_shard(2).is_err());
        assert!(model.release() > 0);
    }

    #[test]
    fn test_indivisible_partition_is_rejected() {
        let memory = DeviceMemory::new(3);
        let layout = StateLayout::Partitioned { num_devices: 3, spec: PartitionSpec::default().with_rule("dense", 0) };
        let err = ModelState::materialize(TrainState::fresh(&metadata(), 1), layout, &memory).unwrap_err();
        assert!(matches!(err, EvalError::CheckpointCorrupt { .. }));
        assert_eq!(memory.stats().allocations, 0);
    }
}
