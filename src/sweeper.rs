//! Periodic eviction of purchase sessions that were never paid.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 60);

pub struct ExpirySweeper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_age: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            interval: DEFAULT_SWEEP_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// One pass over the registry.
    pub async fn sweep(&self) -> usize {
        let evicted = self.registry.remove_if_older_than(self.max_age).await;
        if evicted > 0 {
            tracing::info!(evicted, max_age = ?self.max_age, "Evicted expired sessions");
        } else {
            tracing::debug!("No expired sessions");
        }
        evicted
    }

    /// Sweeps every `interval` until `shutdown` is cancelled. The first sweep happens one
    /// interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
