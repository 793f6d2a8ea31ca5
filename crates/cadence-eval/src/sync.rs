//! Multi-host rendezvous, leader broadcast, and clock-driven polling.
//!
//! Every host runs the same sequence of collective calls. The named barriers
//! make the points where hosts wait for each other explicit in the call
//! sites: after a restore, after each batch's cross-host reduction.

use crate::error::{EvalError, EvalResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Coordination among the cooperating host processes of one job.
#[async_trait]
pub trait HostCoordinator: Send + Sync {
    /// Index of this host; host 0 is the coordinating host.
    fn process_index(&self) -> usize;

    fn process_count(&self) -> usize;

    fn is_leader(&self) -> bool {
        self.process_index() == 0
    }

    /// Blocks until every host reaches the barrier called `name`.
    async fn barrier(&self, name: &str) -> EvalResult<()>;

    /// Returns the leader's `value` on every host.
    async fn broadcast_from_leader(&self, value: i64) -> EvalResult<i64>;
}

/// Coordinator for a job that runs on a single host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleHost;

#[async_trait]
impl HostCoordinator for SingleHost {
    fn process_index(&self) -> usize {
        0
    }

    fn process_count(&self) -> usize {
        1
    }

    async fn barrier(&self, name: &str) -> EvalResult<()> {
        debug!(barrier = name, "single-host barrier");
        Ok(())
    }

    async fn broadcast_from_leader(&self, value: i64) -> EvalResult<i64> {
        Ok(value)
    }
}

#[derive(Debug)]
struct GroupShared {
    barrier: tokio::sync::Barrier,
    slot: Mutex<i64>,
    log: Mutex<Vec<(usize, String)>>,
}

/// One member of a group of hosts simulated inside a single process, each
/// driven by its own task.
#[derive(Debug, Clone)]
pub struct InProcessHost {
    index: usize,
    count: usize,
    shared: Arc<GroupShared>,
}

impl InProcessHost {
    /// Creates `count` coordinated hosts, indexed `0..count`.
    #[must_use]
    pub fn group(count: usize) -> Vec<Self> {
        let shared = Arc::new(GroupShared {
            barrier: tokio::sync::Barrier::new(count),
            slot: Mutex::new(0),
            log: Mutex::new(Vec::new()),
        });
        (0..count).map(|index| Self { index, count, shared: Arc::clone(&shared) }).collect()
    }

    /// Barrier names reached so far, with the host that reached them.
    #[must_use]
    pub fn barrier_log(&self) -> Vec<(usize, String)> {
        self.shared.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

fn poisoned(what: &str) -> EvalError {
    EvalError::Other(anyhow::anyhow!("{what} lock poisoned"))
}

#[async_trait]
impl HostCoordinator for InProcessHost {
    fn process_index(&self) -> usize {
        self.index
    }

    fn process_count(&self) -> usize {
        self.count
    }

    async fn barrier(&self, name: &str) -> EvalResult<()> {
        self.shared
            .log
            .lock()
            .map_err(|_| poisoned("barrier log"))?
            .push((self.index, name.to_string()));
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn broadcast_from_leader(&self, value: i64) -> EvalResult<i64> {
        if self.is_leader() {
            *self.shared.slot.lock().map_err(|_| poisoned("broadcast slot"))? = value;
        }
        self.shared.barrier.wait().await;
        let out = *self.shared.slot.lock().map_err(|_| poisoned("broadcast slot"))?;
        // Nobody may start the next broadcast before every host has read this one.
        self.shared.barrier.wait().await;
        Ok(out)
    }
}

/// Source of waiting, injectable so polling loops run instantly in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct ManualClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Calls `attempt` until it yields a value, sleeping `interval` on `clock`
/// between attempts. Errors from `attempt` end the wait immediately.
pub async fn poll_until<T, F, Fut>(clock: &dyn Clock, interval: Duration, what: &str, mut attempt: F) -> EvalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EvalResult<Option<T>>>,
{
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        if let Some(value) = attempt().await? {
            return Ok(value);
        }
        debug!(waiting_for = what, attempts, interval_secs = interval.as_secs_f64(), "sleeping before next poll");
        clock.sleep(interval).await;
    }
}
