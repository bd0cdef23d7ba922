//! Persistent store for the mirrored catalog and local artifacts.
//!
//! SQLite holds playlists, songs, albums and every file the pipeline has
//! produced, so each tick only fetches what is missing. All writes made by
//! the pipeline go through post-phase effects, one at a time.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{SqliteStateDb, StateDb};
pub use error::StateError;
pub use types::{AlbumRecord, AudioRecord, PlaylistRecord, SongRecord, StoreSummary, SyncRunStats};
