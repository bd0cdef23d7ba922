//! Presence-driven scheduler.
//!
//! One actor owns the run mode, the periodic timer and the device being
//! synced. Presence events and device-sync completions are the only inputs
//! that change the mode, and every status it publishes satisfies
//! `mode == Periodic` exactly when the timer is running.
//!
//! Periodic ticks go to a single job-runner task. A tick that reaches the
//! runner after the mode left `Periodic` is dropped, but a run already in
//! progress when a device is attached is allowed to finish in the
//! background while the device sync starts.

pub mod presence;
mod timer;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use presence::{Device, DeviceFilter, HotplugSource, PresenceEvent};
use timer::PeriodicTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Periodic,
    /// Between modes: the timer is already stopped. Also the startup state
    /// until the initial device scan has run.
    Switching,
    DeviceSync,
    /// The scheduler has shut down.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub mode: RunMode,
    pub timer_running: bool,
    /// Device-sync runs completed since start, successful or not.
    pub device_syncs: u64,
    /// Name of the device being synced.
    pub device: Option<String>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            mode: RunMode::Switching,
            timer_running: false,
            device_syncs: 0,
            device: None,
        }
    }
}

/// What the scheduler drives. Implemented by the job runner; tests plug in
/// fakes.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Run every periodic step once, in order.
    async fn run_periodic(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Run the device-sync path against `device`.
    async fn run_device_sync(
        &self,
        device: &Device,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

pub struct Scheduler {
    pipeline: Arc<dyn Pipeline>,
    source: Arc<dyn HotplugSource>,
    filter: DeviceFilter,
    interval: Duration,
    status: StatusFeed,
}

/// Publishes every status: the latest one through `watch`, each transition
/// through `broadcast`.
#[derive(Clone)]
struct StatusFeed {
    current: watch::Sender<SchedulerStatus>,
    transitions: broadcast::Sender<SchedulerStatus>,
}

impl StatusFeed {
    fn new() -> Self {
        let (current, _) = watch::channel(SchedulerStatus::default());
        let (transitions, _) = broadcast::channel(64);
        Self {
            current,
            transitions,
        }
    }

    fn publish(&self, status: SchedulerStatus) {
        let _ = self.transitions.send(status.clone());
        self.current.send_replace(status);
    }
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        source: Arc<dyn HotplugSource>,
        filter: DeviceFilter,
        interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            source,
            filter,
            interval,
            status: StatusFeed::new(),
        }
    }

    /// The latest published status.
    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.current.subscribe()
    }

    /// Every status in publication order, intermediate `Switching`
    /// included. A slow receiver lags rather than blocking the scheduler.
    pub fn transitions(&self) -> broadcast::Receiver<SchedulerStatus> {
        self.status.transitions.subscribe()
    }

    /// Run the device-sync path once against an explicitly given device,
    /// bypassing presence detection and the periodic timer.
    pub async fn run_override(
        &self,
        device: Device,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        tracing::info!(device = %device.name, "Syncing to given mountpoint");
        self.status.publish(SchedulerStatus {
            mode: RunMode::DeviceSync,
            device: Some(device.name.clone()),
            ..SchedulerStatus::default()
        });
        let result = self.pipeline.run_device_sync(&device, cancel).await;
        self.status.publish(SchedulerStatus {
            mode: RunMode::Stopped,
            device_syncs: 1,
            ..SchedulerStatus::default()
        });
        result
    }

    /// Drive the scheduler until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let (presence_tx, mut presence_rx) = mpsc::channel(16);
        let (ticks_tx, ticks_rx) = mpsc::channel(1);

        let runner = tokio::spawn(run_jobs(
            Arc::clone(&self.pipeline),
            ticks_rx,
            self.status.current.subscribe(),
            cancel.clone(),
        ));

        // Enumerate before subscribing so a device plugged in before launch is
        // not missed.
        let present = match self.source.enumerate().await {
            Ok(devices) => devices.into_iter().find(|d| self.filter.matches(d)),
            Err(e) => {
                tracing::warn!(error = %e, "Initial device scan failed");
                None
            }
        };
        if let Err(e) = self.source.start_monitoring(presence_tx).await {
            tracing::warn!(error = %e, "Device monitoring unavailable, running periodic only");
        }

        let mut actor = Actor {
            pipeline: Arc::clone(&self.pipeline),
            filter: self.filter.clone(),
            timer: PeriodicTimer::new(self.interval),
            ticks: ticks_tx,
            status: self.status.clone(),
            cancel: cancel.clone(),
            mode: RunMode::Switching,
            active: None,
            detached_mid_sync: false,
            device_syncs: 0,
            syncs: JoinSet::new(),
        };

        match present {
            Some(device) => {
                tracing::info!(device = %device.name, "Device already attached at startup");
                actor.begin_sync(device).await;
            }
            None => actor.enter_periodic(),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = presence_rx.recv() => actor.on_presence(event).await,
                Some(joined) = actor.syncs.join_next() => actor.on_sync_done(joined),
            }
        }

        tracing::info!("Scheduler shutting down");
        self.source.stop_monitoring().await;
        actor.shutdown().await;
        if let Err(e) = runner.await {
            tracing::warn!(error = %e, "Job runner task failed");
        }
    }
}

struct Actor {
    pipeline: Arc<dyn Pipeline>,
    filter: DeviceFilter,
    timer: PeriodicTimer,
    ticks: mpsc::Sender<()>,
    status: StatusFeed,
    cancel: CancellationToken,
    mode: RunMode,
    active: Option<Device>,
    detached_mid_sync: bool,
    device_syncs: u64,
    syncs: JoinSet<anyhow::Result<()>>,
}

impl Actor {
    fn publish(&self) {
        self.status.publish(SchedulerStatus {
            mode: self.mode,
            timer_running: self.timer.is_running(),
            device_syncs: self.device_syncs,
            device: self.active.as_ref().map(|d| d.name.clone()),
        });
    }

    fn enter_periodic(&mut self) {
        self.timer.start(self.ticks.clone());
        self.mode = RunMode::Periodic;
        self.publish();
        tracing::info!("Periodic mode");
    }

    async fn begin_sync(&mut self, device: Device) {
        self.mode = RunMode::Switching;
        self.timer.stop().await;
        self.publish();

        self.mode = RunMode::DeviceSync;
        self.active = Some(device.clone());
        self.detached_mid_sync = false;
        self.publish();
        tracing::info!(device = %device.name, "Device sync mode");

        let pipeline = Arc::clone(&self.pipeline);
        let cancel = self.cancel.clone();
        self.syncs
            .spawn(async move { pipeline.run_device_sync(&device, &cancel).await });
    }

    async fn on_presence(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Attached(device) => {
                if !self.filter.matches(&device) {
                    tracing::debug!(device = %device.name, "Ignoring unrelated device");
                    return;
                }
                if let Some(active) = &self.active {
                    tracing::debug!(
                        device = %device.name,
                        syncing = %active.name,
                        "Sync already running, ignoring attach"
                    );
                    return;
                }
                tracing::info!(device = %device.name, "Device attached");
                self.begin_sync(device).await;
            }
            PresenceEvent::Detached(device) => match &self.active {
                Some(active) if active.name == device.name => {
                    tracing::warn!(
                        device = %device.name,
                        "Device detached while syncing, letting the sync finish"
                    );
                    self.detached_mid_sync = true;
                }
                _ => tracing::debug!(device = %device.name, "Device detached"),
            },
        }
    }

    fn on_sync_done(&mut self, joined: Result<anyhow::Result<()>, JoinError>) {
        let name = self
            .active
            .take()
            .map(|d| d.name)
            .unwrap_or_default();
        match joined {
            Ok(Ok(())) if self.detached_mid_sync => {
                tracing::warn!(device = %name, "Device sync finished after the device was removed");
            }
            Ok(Ok(())) => tracing::info!(device = %name, "Device sync complete"),
            Ok(Err(e)) => tracing::error!(device = %name, error = %e, "Device sync failed"),
            Err(e) => tracing::error!(device = %name, error = %e, "Device sync task failed"),
        }
        self.device_syncs += 1;
        self.detached_mid_sync = false;
        self.enter_periodic();
    }

    async fn shutdown(&mut self) {
        self.timer.stop().await;
        while let Some(joined) = self.syncs.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Device sync task failed during shutdown");
            }
        }
        self.active = None;
        self.mode = RunMode::Stopped;
        self.publish();
    }
}

/// Consume ticks one at a time. A failing or panicking run is logged and
/// the next tick runs as usual.
async fn run_jobs(
    pipeline: Arc<dyn Pipeline>,
    mut ticks: mpsc::Receiver<()>,
    mut status: watch::Receiver<SchedulerStatus>,
    cancel: CancellationToken,
) {
    loop {
        let tick = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = ticks.recv() => tick,
        };
        if tick.is_none() {
            break;
        }
        // A tick sent just before the timer's start is published still
        // belongs to the new periodic phase.
        let mode = match status.wait_for(|s| s.mode != RunMode::Switching).await {
            Ok(current) => current.mode,
            Err(_) => break,
        };
        if mode != RunMode::Periodic {
            tracing::debug!(?mode, "Dropping tick outside periodic mode");
            continue;
        }

        tracing::info!("Periodic run starting");
        let started = Instant::now();
        match AssertUnwindSafe(pipeline.run_periodic(&cancel))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Periodic run finished"
            ),
            Ok(Err(e)) => tracing::error!(error = %e, "Periodic run failed"),
            Err(_) => tracing::error!("Periodic run panicked"),
        }
    }
}
