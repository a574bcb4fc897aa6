use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A session idle for longer than this is reaped.
    pub idle_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Background task that periodically reaps idle sessions.
pub struct Reaper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Reaper {
    /// Start sweeping `registry`. Must be called from within a tokio runtime.
    pub fn spawn(registry: SessionRegistry, config: ReaperConfig) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick

            tracing::debug!(
                interval_secs = config.interval.as_secs(),
                idle_timeout_secs = config.idle_timeout.as_secs(),
                "reaper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle(config.idle_timeout);
                        if !reaped.is_empty() {
                            tracing::info!(count = reaped.len(), remaining = registry.len(), "reaper sweep");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            tracing::debug!("reaper stopped");
        });
        Self { cancel, task }
    }

    /// Stop the task and wait for it. An in-progress sweep finishes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "reaper task failed");
        }
    }
}
