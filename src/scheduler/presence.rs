//! Device presence detection.
//!
//! [`HotplugSource`] is the seam between the scheduler and whatever tells
//! us a player was plugged in. [`MountPoller`] treats every directory under
//! a media root (e.g. `/run/media/$USER`) as a mounted volume and reports
//! differences between polls.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub mountpoints: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Attached(Device),
    Detached(Device),
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Failed to enumerate devices under {}: {source}", root.display())]
    Enumerate {
        root: PathBuf,
        source: std::io::Error,
    },

    #[error("Monitoring already started")]
    AlreadyMonitoring,
}

/// Substring match on the device name.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    needle: String,
}

impl DeviceFilter {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        device.name.contains(&self.needle)
    }
}

#[async_trait]
pub trait HotplugSource: Send + Sync {
    /// Devices attached right now.
    async fn enumerate(&self) -> Result<Vec<Device>, PresenceError>;

    /// Begin delivering events on `events` until [`HotplugSource::stop_monitoring`].
    async fn start_monitoring(
        &self,
        events: mpsc::Sender<PresenceEvent>,
    ) -> Result<(), PresenceError>;

    async fn stop_monitoring(&self);
}

pub struct MountPoller {
    root: PathBuf,
    interval: Duration,
    /// What the last [`HotplugSource::enumerate`] reported. Monitoring diffs
    /// against it, so a volume mounted in between still yields `Attached`.
    last_seen: Mutex<Option<BTreeMap<String, Device>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MountPoller {
    pub fn new(root: PathBuf, interval: Duration) -> Self {
        Self {
            root,
            interval,
            last_seen: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

/// A missing root just means nothing has been mounted yet.
async fn scan(root: &PathBuf) -> Result<BTreeMap<String, Device>, PresenceError> {
    let enumerate_err = |source| PresenceError::Enumerate {
        root: root.clone(),
        source,
    };
    let mut devices = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(devices),
        Err(e) => return Err(enumerate_err(e)),
    };
    while let Some(entry) = entries.next_entry().await.map_err(enumerate_err)? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        devices.insert(
            name.clone(),
            Device {
                name,
                mountpoints: vec![entry.path()],
            },
        );
    }
    Ok(devices)
}

fn diff(
    before: &BTreeMap<String, Device>,
    after: &BTreeMap<String, Device>,
) -> Vec<PresenceEvent> {
    let gone = before
        .iter()
        .filter(|(name, _)| !after.contains_key(*name))
        .map(|(_, d)| PresenceEvent::Detached(d.clone()));
    let new = after
        .iter()
        .filter(|(name, _)| !before.contains_key(*name))
        .map(|(_, d)| PresenceEvent::Attached(d.clone()));
    gone.chain(new).collect()
}

#[async_trait]
impl HotplugSource for MountPoller {
    async fn enumerate(&self) -> Result<Vec<Device>, PresenceError> {
        let devices = scan(&self.root).await?;
        *self.last_seen.lock().await = Some(devices.clone());
        Ok(devices.into_values().collect())
    }

    async fn start_monitoring(
        &self,
        events: mpsc::Sender<PresenceEvent>,
    ) -> Result<(), PresenceError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(PresenceError::AlreadyMonitoring);
        }

        let root = self.root.clone();
        let interval = self.interval;
        let token = CancellationToken::new();
        let child = token.clone();
        let mut known = match self.last_seen.lock().await.take() {
            Some(seen) => seen,
            None => scan(&root).await.unwrap_or_default(),
        };

        let handle = tokio::spawn(async move {
            let mut failing = false;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let current = match scan(&root).await {
                    Ok(current) => {
                        if failing {
                            tracing::info!("Device polling recovered");
                            failing = false;
                        }
                        current
                    }
                    Err(e) => {
                        if !failing {
                            tracing::warn!(error = %e, "Device polling failed, will keep trying");
                            failing = true;
                        }
                        continue;
                    }
                };
                for event in diff(&known, &current) {
                    tracing::debug!(?event, "Presence change");
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
        });

        *task = Some((token, handle));
        Ok(())
    }

    async fn stop_monitoring(&self) {
        if let Some((token, handle)) = self.task.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Device poller task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> Device {
        Device {
            name: name.into(),
            mountpoints: vec![PathBuf::from(format!("/media/{name}"))],
        }
    }

    #[test]
    fn test_filter_is_substring_match() {
        let filter = DeviceFilter::new("WALKMAN");
        assert!(filter.matches(&device("WALKMAN")));
        assert!(filter.matches(&device("NW-A45 WALKMAN")));
        assert!(!filter.matches(&device("walkman")));
        assert!(!filter.matches(&device("USB DISK")));
    }

    #[test]
    fn test_diff_reports_both_directions() {
        let before: BTreeMap<_, _> = [("A".to_string(), device("A"))].into();
        let after: BTreeMap<_, _> = [("B".to_string(), device("B"))].into();
        assert_eq!(
            diff(&before, &after),
            vec![
                PresenceEvent::Detached(device("A")),
                PresenceEvent::Attached(device("B")),
            ]
        );
        assert!(diff(&after, &after).is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_lists_directories_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("WALKMAN")).unwrap();
        std::fs::write(dir.path().join("stray-file"), b"").unwrap();
        let poller = MountPoller::new(dir.path().to_path_buf(), Duration::from_millis(10));
        let devices = poller.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "WALKMAN");
        assert_eq!(devices[0].mountpoints, vec![dir.path().join("WALKMAN")]);
    }

    #[tokio::test]
    async fn test_missing_root_means_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let poller = MountPoller::new(dir.path().join("absent"), Duration::from_millis(10));
        assert!(poller.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitoring_reports_attach_and_detach() {
        let dir = tempfile::tempdir().unwrap();
        let poller = MountPoller::new(dir.path().to_path_buf(), Duration::from_millis(10));
        let (tx, mut rx) = mpsc::channel(8);
        poller.start_monitoring(tx.clone()).await.unwrap();
        assert!(matches!(
            poller.start_monitoring(tx).await,
            Err(PresenceError::AlreadyMonitoring)
        ));

        let mount = dir.path().join("WALKMAN");
        std::fs::create_dir(&mount).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PresenceEvent::Attached(ref d) if d.name == "WALKMAN"));

        std::fs::remove_dir(&mount).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PresenceEvent::Detached(ref d) if d.name == "WALKMAN"));

        poller.stop_monitoring().await;
        // Stopping twice is harmless.
        poller.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_mount_between_enumerate_and_monitoring_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let poller = MountPoller::new(dir.path().to_path_buf(), Duration::from_millis(10));
        assert!(poller.enumerate().await.unwrap().is_empty());

        std::fs::create_dir(dir.path().join("WALKMAN")).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        poller.start_monitoring(tx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PresenceEvent::Attached(ref d) if d.name == "WALKMAN"));
        poller.stop_monitoring().await;
    }
}
