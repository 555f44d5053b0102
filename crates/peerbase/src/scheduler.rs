//! Periodic sync with every configured peer.
//!
//! One task per peer. After a successful round the next one starts after
//! `interval`; after consecutive failures the delay grows by
//! `backoff_factor` from `initial_backoff` up to `max_backoff`. Every delay
//! is spread by a random `jitter` fraction so peers that failed together do
//! not retry in lockstep.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerbase_core::PeerId;
use peerbase_sync::{SyncEngine, SyncError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When false, [`Node::start_scheduler`](crate::Node::start_scheduler)
    /// starts nothing and sync only runs on demand.
    pub enabled: bool,
    /// Delay between rounds while rounds succeed.
    pub interval: Duration,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for the failure delay.
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Fraction of each delay that is randomised, in `0..=1`.
    pub jitter: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl SchedulerConfig {
    /// Delay before the next round after `failures` consecutive failures,
    /// before jitter.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Handle to the running sync tasks. Dropping it without calling
/// [`Scheduler::shutdown`] stops the tasks at their next wake-up.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn one task per peer on the current tokio runtime.
    pub fn start(engine: Arc<SyncEngine>, peers: Vec<PeerId>, config: SchedulerConfig) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let tasks = peers
            .into_iter()
            .map(|peer| {
                tokio::spawn(run_peer(
                    engine.clone(),
                    peer,
                    config.clone(),
                    signal.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(peers = tasks.len(), interval = ?config.interval, "sync scheduler started");
        Self { shutdown, tasks }
    }

    /// Stop every task and wait for in-flight rounds to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        info!("sync scheduler stopped");
    }
}

async fn run_peer(
    engine: Arc<SyncEngine>,
    peer: PeerId,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;

    loop {
        let delay = config.jittered(config.delay_after(failures));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // A closed channel means the handle is gone.
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        match engine.sync_with(&peer).await {
            Ok(_) => failures = 0,
            Err(SyncError::SyncInProgress(_)) => {
                debug!(%peer, "round already running, skipping");
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(%peer, failures, error = %e, "scheduled sync failed");
            }
        }
    }

    debug!(%peer, "sync task stopped");
}
