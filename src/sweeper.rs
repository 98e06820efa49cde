//! Background eviction of stale client windows.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::ratelimit::RateLimiter;

/// Handle to a running sweep task.
///
/// The task calls [`RateLimiter::sweep_now`] once per period. It stops on
/// [`Sweeper::shutdown`] and is aborted when the handle is dropped.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a sweeper using the limiter's configured interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(limiter: Arc<RateLimiter>) -> Self {
        let period = limiter.config().sweep_interval();
        Self::spawn(limiter, period)
    }

    /// Spawn a sweeper with an explicit period (at least one millisecond).
    pub fn spawn(limiter: Arc<RateLimiter>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        info!(period_ms = period.as_millis() as u64, "Starting window sweeper");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Window sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match limiter.sweep_now() {
                            Ok(removed) => trace!(removed = removed, "Sweep tick"),
                            Err(e) => warn!(error = %e, "Sweep skipped"),
                        }
                    }
                }
            }
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Whether the sweep task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Window sweeper ended abnormally");
            }
        }
        info!("Window sweeper stopped");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
