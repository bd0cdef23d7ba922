//! Remote music catalog: playlists, followed albums, and byte streams for
//! audio and artwork.

pub mod error;
pub mod qqmusic;

use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use error::CatalogError;
pub use qqmusic::QqMusicClient;

use crate::types::Bitrate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artist {
    pub id: i64,
    pub mid: String,
    pub name: String,
}

/// Album as referenced from a song. `mid` may be empty for older entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRef {
    pub id: i64,
    pub mid: String,
    pub name: String,
}

/// Album the user follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Album {
    pub id: i64,
    pub mid: String,
    pub name: String,
    pub artist: Option<Artist>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    pub id: i64,
    pub mid: String,
    pub name: String,
    pub album: Option<AlbumRef>,
    pub artists: Vec<Artist>,
    /// Remote sizes per variant; zero means the variant is not offered.
    pub size128: u64,
    pub size320: u64,
    pub size_flac: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    pub song_count: u32,
}

/// Remote bytes, chunk by chunk, with the announced length if any.
pub struct RemoteStream {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, CatalogError>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Playlists created by the user.
    async fn playlists(&self, uin: &str) -> Result<Vec<Playlist>, CatalogError>;

    async fn playlist_songs(&self, playlist_id: i64) -> Result<Vec<Song>, CatalogError>;

    /// Albums the user follows, across every page.
    async fn albums(&self, uin: &str) -> Result<Vec<Album>, CatalogError>;

    async fn audio_stream(&self, song_mid: &str, bitrate: Bitrate)
        -> Result<RemoteStream, CatalogError>;

    async fn artwork_stream(&self, album_id: i64) -> Result<RemoteStream, CatalogError>;
}
