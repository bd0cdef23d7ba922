//! Fixed-cadence tick source for the periodic pipeline.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct PeriodicTimer {
    interval: Duration,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl PeriodicTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start ticking into `ticks`. The first tick fires immediately. A tick
    /// that finds the channel full is dropped, so a slow run never piles up
    /// a backlog. Starting a running timer does nothing.
    pub fn start(&mut self, ticks: mpsc::Sender<()>) {
        if self.running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match ticks.try_send(()) {
                    Ok(()) => tracing::debug!("Periodic tick"),
                    Err(TrySendError::Full(())) => {
                        tracing::debug!("Previous run still busy, coalescing tick");
                    }
                    Err(TrySendError::Closed(())) => break,
                }
            }
        });
        self.running = Some((token, handle));
        tracing::info!(interval_secs = period.as_secs(), "Periodic timer started");
    }

    /// Stop ticking and wait until the tick task is gone. A no-op when the
    /// timer is not running.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.running.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Timer task failed");
        }
        tracing::info!("Periodic timer stopped");
    }
}
