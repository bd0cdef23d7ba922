use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::{Bitrate, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "walkman-go",
    version,
    about = "Mirror music playlists locally and sync them to a portable player"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Working directory for the database, audio, artwork and playlists
    #[arg(long, env = "WALKMAN_GO_WORKDIR", default_value = "~/.walkman-go")]
    pub workdir: String,

    /// Music service user identifier
    #[arg(long, env = "WALKMAN_GO_UIN")]
    pub uin: Option<String>,

    /// Audio variant to download, tag and sync
    #[arg(long, env = "WALKMAN_GO_BITRATE", value_enum, default_value = "320")]
    pub bitrate: Bitrate,

    /// Playlist(s) to sync, by name (default: all)
    #[arg(
        long = "playlist",
        env = "WALKMAN_GO_PLAYLISTS",
        value_delimiter = ','
    )]
    pub playlists: Vec<String>,

    /// Sync to an already mounted device and exit, bypassing detection
    #[arg(
        long = "mountpoint",
        env = "WALKMAN_GO_MOUNTPOINTS",
        value_delimiter = ','
    )]
    pub mountpoints: Vec<PathBuf>,

    /// Volume name (or part of it) identifying the player
    #[arg(long, env = "WALKMAN_GO_DEVICE_NAME", default_value = "WALKMAN")]
    pub device_name: String,

    /// Directory whose subdirectories are mounted volumes (default: /run/media/$USER)
    #[arg(long, env = "WALKMAN_GO_MEDIA_ROOT")]
    pub media_root: Option<PathBuf>,

    /// Seconds between periodic runs
    #[arg(long, default_value_t = 300)]
    pub interval: u64,

    /// Seconds between device presence polls
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,

    /// Number of concurrent transfers and tag rewrites
    #[arg(long, default_value_t = 4)]
    pub threads_num: u16,

    /// Write the catalog's album name instead of "Unknown"
    #[arg(long)]
    pub catalog_album_tags: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run every periodic step once and exit
    Once,
    /// Show what the local database holds
    Status,
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.unwrap_or(Command::Run)
    }
}
