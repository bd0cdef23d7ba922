//! Fakes shared by the job tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tempfile::TempDir;

use super::{AlbumSource, JobContext, JobSettings};
use crate::catalog::{
    Album, AlbumRef, Artist, Catalog, CatalogError, Playlist, RemoteStream, Song,
};
use crate::progress::NoProgress;
use crate::state::SqliteStateDb;
use crate::tags::{fixtures, AudioFormat, LoftyCodec, TagCodec, TagError, TagFields, TagState};
use crate::types::Bitrate;

pub fn song(id: i64, mid: &str, size: u64) -> Song {
    Song {
        id,
        mid: mid.into(),
        name: format!("Song {id}"),
        album: None,
        artists: vec![Artist {
            id: 1,
            mid: "artist1".into(),
            name: "Artist".into(),
        }],
        size128: size,
        size320: size,
        size_flac: 0,
    }
}

pub fn song_on_album(id: i64, mid: &str, album_id: i64, album_mid: &str) -> Song {
    Song {
        album: Some(AlbumRef {
            id: album_id,
            mid: album_mid.into(),
            name: format!("Album {album_id}"),
        }),
        ..song(id, mid, 100)
    }
}

fn remote(bytes: Vec<u8>) -> RemoteStream {
    RemoteStream {
        content_length: Some(bytes.len() as u64),
        body: futures_util::stream::iter(vec![Ok(Bytes::from(bytes))]).boxed(),
    }
}

fn not_found(endpoint: &'static str) -> CatalogError {
    CatalogError::HttpStatus {
        status: 404,
        endpoint,
        body: String::new(),
    }
}

/// In-memory catalog. Audio for any known song is a tiny valid file of the
/// requested format; artwork is served for albums present in `artwork`.
#[derive(Default)]
pub struct FakeCatalog {
    pub playlists: Vec<Playlist>,
    pub songs: HashMap<i64, Vec<Song>>,
    pub albums: Vec<Album>,
    pub artwork: HashMap<i64, Vec<u8>>,
    /// Song mids whose audio request fails.
    pub broken_audio: Vec<String>,
    pub fail_listing: bool,
    pub audio_calls: AtomicUsize,
    pub artwork_calls: AtomicUsize,
}

impl FakeCatalog {
    pub fn add_playlist(&mut self, playlist: Playlist, songs: Vec<Song>) {
        self.songs.insert(playlist.id, songs);
        self.playlists.push(playlist);
    }

    pub fn network_calls(&self) -> usize {
        self.audio_calls.load(Ordering::SeqCst) + self.artwork_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn playlists(&self, _uin: &str) -> Result<Vec<Playlist>, CatalogError> {
        if self.fail_listing {
            return Err(not_found("playlists"));
        }
        Ok(self.playlists.clone())
    }

    async fn playlist_songs(&self, playlist_id: i64) -> Result<Vec<Song>, CatalogError> {
        self.songs
            .get(&playlist_id)
            .cloned()
            .ok_or_else(|| not_found("playlist_songs"))
    }

    async fn albums(&self, _uin: &str) -> Result<Vec<Album>, CatalogError> {
        if self.fail_listing {
            return Err(not_found("albums"));
        }
        Ok(self.albums.clone())
    }

    async fn audio_stream(
        &self,
        song_mid: &str,
        bitrate: Bitrate,
    ) -> Result<RemoteStream, CatalogError> {
        self.audio_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_audio.iter().any(|m| m == song_mid) {
            return Err(not_found("audio"));
        }
        let bytes = match bitrate {
            Bitrate::Flac => fixtures::flac_stream(),
            Bitrate::Mp3_128 | Bitrate::Mp3_320 => fixtures::mpeg_frames(4),
        };
        Ok(remote(bytes))
    }

    async fn artwork_stream(&self, album_id: i64) -> Result<RemoteStream, CatalogError> {
        self.artwork_calls.fetch_add(1, Ordering::SeqCst);
        self.artwork
            .get(&album_id)
            .cloned()
            .map(remote)
            .ok_or_else(|| not_found("artwork"))
    }
}

/// Real codec with call counters.
#[derive(Default)]
pub struct CountingCodec {
    inner: LoftyCodec,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl TagCodec for CountingCodec {
    fn read_state(&self, path: &Path, format: AudioFormat) -> Result<TagState, TagError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_state(path, format)
    }

    fn write(&self, path: &Path, format: AudioFormat, fields: &TagFields) -> Result<(), TagError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(path, format, fields)
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A context over a temporary workdir and an in-memory store.
pub struct TestEnv {
    pub dir: TempDir,
    pub catalog: Arc<FakeCatalog>,
    pub db: Arc<SqliteStateDb>,
    pub codec: Arc<CountingCodec>,
    pub ctx: JobContext,
}

impl TestEnv {
    pub fn new(catalog: FakeCatalog) -> Self {
        Self::with_variant(catalog, Bitrate::Mp3_320)
    }

    pub fn with_variant(catalog: FakeCatalog, variant: Bitrate) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(catalog);
        let db = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let codec = Arc::new(CountingCodec::default());
        let settings = JobSettings {
            uin: "10001".into(),
            variant,
            audio_dir: dir.path().join("audio"),
            artwork_dir: dir.path().join("artwork"),
            playlists_dir: dir.path().join("playlists"),
            playlist_filter: Vec::new(),
            concurrency: 3,
            album_tags: AlbumSource::placeholder(),
        };
        let ctx = JobContext {
            settings: Arc::new(settings),
            catalog: catalog.clone(),
            db: db.clone(),
            codec: codec.clone(),
            progress: Arc::new(NoProgress),
        };
        Self {
            dir,
            catalog,
            db,
            codec,
            ctx,
        }
    }

    pub fn settings_mut(&mut self) -> &mut JobSettings {
        Arc::make_mut(&mut self.ctx.settings)
    }
}
