//! Accelerator memory accounting and cross-device reductions.
//!
//! Device memory holds exactly one model state at a time. A state is
//! allocated when a checkpoint is materialized and must be released before
//! the next one is; [`DeviceMemory::allocate`] refuses a second live state
//! instead of silently holding two.

use crate::error::{EvalError, EvalResult};
use cadence_abstraction::{PerExampleRecord, Tensor};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Summary tensors keyed by name.
pub type SummaryTensors = BTreeMap<String, Tensor>;

#[derive(Debug, Default)]
struct MemoryLedger {
    live: Option<(u64, usize)>,
    allocations: u64,
    releases: u64,
    peak_bytes: usize,
}

/// Snapshot of [`DeviceMemory`] counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub live_step: Option<u64>,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub allocations: u64,
    pub releases: u64,
}

/// Per-host view of the accelerator memory shared by `num_devices` devices.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    num_devices: usize,
    ledger: Arc<Mutex<MemoryLedger>>,
}

impl DeviceMemory {
    #[must_use]
    pub fn new(num_devices: usize) -> Self {
        Self { num_devices: num_devices.max(1), ledger: Arc::new(Mutex::new(MemoryLedger::default())) }
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Reserves room for the state of `step`, `bytes_per_device` on each device.
    pub fn allocate(&self, step: u64, bytes_per_device: usize) -> EvalResult<DeviceAllocation> {
        let mut ledger = self.lock()?;
        if let Some((live_step, _)) = ledger.live {
            return Err(EvalError::StateAlreadyLive { live_step });
        }
        let total = bytes_per_device * self.num_devices;
        ledger.live = Some((step, total));
        ledger.allocations += 1;
        ledger.peak_bytes = ledger.peak_bytes.max(total);
        debug!(step, bytes = total, devices = self.num_devices, "allocated device state");
        Ok(DeviceAllocation { memory: self.clone(), step, bytes: total, released: false })
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.ledger
            .lock()
            .map(|l| MemoryStats {
                live_step: l.live.map(|(s, _)| s),
                bytes_in_use: l.live.map_or(0, |(_, b)| b),
                peak_bytes: l.peak_bytes,
                allocations: l.allocations,
                releases: l.releases,
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> EvalResult<std::sync::MutexGuard<'_, MemoryLedger>> {
        self.ledger.lock().map_err(|_| EvalError::Other(anyhow::anyhow!("device memory ledger poisoned")))
    }

    fn free(&self, step: u64) -> usize {
        let Ok(mut ledger) = self.ledger.lock() else {
            return 0;
        };
        match ledger.live {
            Some((live, bytes)) if live == step => {
                ledger.live = None;
                ledger.releases += 1;
                bytes
            }
            _ => 0,
        }
    }
}

/// Handle to the single live state on the devices.
#[derive(Debug)]
pub struct DeviceAllocation {
    memory: DeviceMemory,
    step: u64,
    bytes: usize,
    released: bool,
}

impl DeviceAllocation {
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Frees the allocation, returning the number of bytes released.
    pub fn release(mut self) -> usize {
        self.released = true;
        self.memory.free(self.step)
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if !self.released {
            let bytes = self.memory.free(self.step);
            warn!(step = self.step, bytes, "device state dropped without an explicit release");
        }
    }
}

/// A value produced by a step function, before it is brought back to host.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceValues<T> {
    /// Already reduced on the host.
    Host(T),
    /// Identical copy on every device.
    Replicated(Vec<T>),
    /// One distinct part per device, to be reduced with [`Collect`].
    PerDevice(Vec<T>),
}

impl<T: Collect> DeviceValues<T> {
    /// Brings the value back to the host, reducing per-device parts.
    pub fn into_host(self) -> EvalResult<T> {
        match self {
            Self::Host(value) => Ok(value),
            Self::Replicated(copies) => copies
                .into_iter()
                .next()
                .ok_or_else(|| EvalError::Other(anyhow::anyhow!("replicated value has no copies"))),
            Self::PerDevice(parts) => {
                if parts.is_empty() {
                    return Err(EvalError::Other(anyhow::anyhow!("per-device value has no parts")));
                }
                T::all_reduce(parts)
            }
        }
    }
}

impl<T: Default> Default for DeviceValues<T> {
    fn default() -> Self {
        Self::Host(T::default())
    }
}

/// Cross-device reduction of per-device parts into one host value.
pub trait Collect: Sized {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self>;
}

/// Loss: mean over devices.
impl Collect for f32 {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self> {
        let n = parts.len() as f32;
        Ok(parts.into_iter().sum::<f32>() / n)
    }
}

/// Per-example records: concatenated in device order, the tiled gather.
impl Collect for Vec<PerExampleRecord> {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self> {
        Ok(parts.into_iter().flatten().collect())
    }
}

/// Summaries: elementwise mean per name. Every device must report the same names.
impl Collect for SummaryTensors {
    fn all_reduce(parts: Vec<Self>) -> EvalResult<Self> {
        let mut iter = parts.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Self::new());
        };
        let mut grouped: BTreeMap<String, Vec<Tensor>> =
            first.into_iter().map(|(k, v)| (k, vec![v])).collect();
        for part in iter {
            let left: Vec<String> = grouped.keys().cloned().collect();
            let right: Vec<String> = part.keys().cloned().collect();
            if left != right {
                return Err(EvalError::KeyMismatch { left, right });
            }
            for (k, v) in part {
                if let Some(series) = grouped.get_mut(&k) {
                    series.push(v);
                }
            }
        }
        grouped.into_iter().map(|(k, series)| Ok((k, Tensor::mean(&series)?))).collect()
    }
}
