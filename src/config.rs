use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::cli::Cli;
use crate::jobs::{AlbumSource, JobSettings};
use crate::scheduler::presence::Device;
use crate::types::Bitrate;

/// Application configuration, validated and with the workdir layout
/// resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub workdir: PathBuf,
    pub uin: Option<String>,
    pub playlists: Vec<String>,
    pub mountpoints: Vec<PathBuf>,
    pub device_name: String,
    pub media_root: PathBuf,

    pub interval: Duration,
    pub poll_interval: Duration,

    pub threads_num: u16,

    pub bitrate: Bitrate,

    pub catalog_album_tags: bool,
    pub no_progress_bar: bool,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn default_media_root() -> PathBuf {
    let user = std::env::var("USER")
        .ok()
        .or_else(|| {
            dirs::home_dir()
                .and_then(|h| h.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_default();
    Path::new("/run/media").join(user)
}

impl Config {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        if cli.threads_num == 0 {
            anyhow::bail!("--threads-num must be at least 1");
        }
        if cli.interval == 0 {
            anyhow::bail!("--interval must be at least 1 second");
        }
        if cli.poll_interval == 0 {
            anyhow::bail!("--poll-interval must be at least 1 second");
        }

        Ok(Self {
            workdir: expand_tilde(&cli.workdir),
            uin: cli.uin.clone().filter(|u| !u.trim().is_empty()),
            playlists: cli
                .playlists
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            mountpoints: cli.mountpoints.clone(),
            device_name: cli.device_name.clone(),
            media_root: cli.media_root.clone().unwrap_or_else(default_media_root),
            interval: Duration::from_secs(cli.interval),
            poll_interval: Duration::from_secs(cli.poll_interval),
            threads_num: cli.threads_num,
            bitrate: cli.bitrate,
            catalog_album_tags: cli.catalog_album_tags,
            no_progress_bar: cli.no_progress_bar,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.workdir.join("walkman.db")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.workdir.join("audio")
    }

    pub fn artwork_dir(&self) -> PathBuf {
        self.workdir.join("artwork")
    }

    pub fn playlists_dir(&self) -> PathBuf {
        self.workdir.join("playlists")
    }

    /// The explicitly given device, when mountpoints were configured.
    pub fn override_device(&self) -> Option<Device> {
        if self.mountpoints.is_empty() {
            return None;
        }
        Some(Device {
            name: self.device_name.clone(),
            mountpoints: self.mountpoints.clone(),
        })
    }

    pub fn job_settings(&self) -> anyhow::Result<JobSettings> {
        let uin = self
            .uin
            .clone()
            .context("A user identifier is required (--uin or WALKMAN_GO_UIN)")?;
        Ok(JobSettings {
            uin,
            variant: self.bitrate,
            audio_dir: self.audio_dir(),
            artwork_dir: self.artwork_dir(),
            playlists_dir: self.playlists_dir(),
            playlist_filter: self.playlists.clone(),
            concurrency: usize::from(self.threads_num),
            album_tags: if self.catalog_album_tags {
                AlbumSource::FromCatalog
            } else {
                AlbumSource::placeholder()
            },
        })
    }
}
