//! Records returned by the store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::types::Bitrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistRecord {
    pub id: i64,
    pub name: String,
    pub song_count: u32,
}

/// A song as the pipeline needs it: enough to name files and fill tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongRecord {
    pub id: i64,
    pub mid: String,
    pub name: String,
    pub album_id: Option<i64>,
    pub album_name: Option<String>,
    /// Artist names in catalog order.
    pub artists: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRecord {
    pub id: i64,
    pub mid: String,
    pub name: String,
    pub artwork_path: Option<PathBuf>,
}

/// A local audio file and the song it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRecord {
    pub local_id: i64,
    pub path: PathBuf,
    pub mime_type: String,
    pub bitrate: Bitrate,
    pub song: SongRecord,
}

/// Totals recorded for one pipeline tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    /// Shutdown was requested before every step ran.
    pub interrupted: bool,
}

impl SyncRunStats {
    pub fn record_step(&mut self, ok: bool, units_succeeded: usize, units_failed: usize) {
        if ok {
            self.steps_succeeded += 1;
        } else {
            self.steps_failed += 1;
        }
        self.units_succeeded += units_succeeded as u64;
        self.units_failed += units_failed as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub playlists: u64,
    pub songs: u64,
    pub followed_albums: u64,
    pub audio_files: u64,
    pub artworks: u64,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}
