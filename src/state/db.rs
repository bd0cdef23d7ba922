//! Store trait and SQLite implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};

use super::error::StateError;
use super::schema;
use super::types::{
    AlbumRecord, AudioRecord, PlaylistRecord, SongRecord, StoreSummary, SyncRunStats,
};
use crate::catalog::{Album, Artist, Playlist, Song};
use crate::types::Bitrate;

/// Object-safe so jobs can share it as `Arc<dyn StateDb>`.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Store a playlist with its songs, replacing any previous membership.
    async fn replace_playlist(&self, playlist: &Playlist, songs: &[Song])
        -> Result<(), StateError>;

    /// Forget playlists whose id is not in `keep`. Returns how many went.
    async fn prune_playlists(&self, keep: &[i64]) -> Result<u64, StateError>;

    /// Record the followed albums; albums missing from `albums` are unfollowed.
    async fn follow_albums(&self, albums: &[Album]) -> Result<(), StateError>;

    async fn get_playlists(&self) -> Result<Vec<PlaylistRecord>, StateError>;

    /// Local audio of one playlist for `bitrate`, in playlist order.
    async fn get_playlist_audios(
        &self,
        playlist_id: i64,
        bitrate: Bitrate,
    ) -> Result<Vec<AudioRecord>, StateError>;

    /// Playlist songs offered in `bitrate` that have no local file for it.
    async fn songs_missing_audio(&self, bitrate: Bitrate) -> Result<Vec<SongRecord>, StateError>;

    /// Link a fetched audio file to its song. Returns the local id.
    async fn add_audio(&self, song_id: i64, bitrate: Bitrate, path: &Path)
        -> Result<i64, StateError>;

    async fn get_audios(&self, bitrate: Bitrate) -> Result<Vec<AudioRecord>, StateError>;

    /// Followed or playlist-referenced albums with no artwork yet.
    async fn albums_missing_artwork(&self) -> Result<Vec<AlbumRecord>, StateError>;

    async fn set_album_artwork(&self, album_id: i64, path: &Path) -> Result<(), StateError>;

    async fn start_sync_run(&self) -> Result<i64, StateError>;

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats)
        -> Result<(), StateError>;

    async fn get_summary(&self) -> Result<StoreSummary, StateError>;
}

pub struct SqliteStateDb {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;
            schema::migrate(&conn)?;
            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }

    /// Run `f` inside one transaction; nothing is written if it fails.
    fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let value = f(&tx).map_err(StateError::query)?;
        tx.commit().map_err(StateError::query)?;
        Ok(value)
    }
}

fn size_column(bitrate: Bitrate) -> &'static str {
    match bitrate {
        Bitrate::Mp3_128 => "size_128",
        Bitrate::Mp3_320 => "size_320",
        Bitrate::Flac => "size_flac",
    }
}

fn upsert_artist(conn: &Connection, artist: &Artist) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO artists (id, mid, name) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET mid = excluded.mid, name = excluded.name",
        rusqlite::params![artist.id, &artist.mid, &artist.name],
    )?;
    Ok(())
}

/// Song references sometimes carry an empty mid; never overwrite a known one.
fn upsert_album(
    conn: &Connection,
    id: i64,
    mid: &str,
    name: &str,
    artist_id: Option<i64>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO albums (id, mid, name, artist_id) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            mid = CASE WHEN excluded.mid <> '' THEN excluded.mid ELSE albums.mid END,
            name = excluded.name,
            artist_id = COALESCE(excluded.artist_id, albums.artist_id)",
        rusqlite::params![id, mid, name, artist_id],
    )?;
    Ok(())
}

fn upsert_song(conn: &Connection, song: &Song, now: i64) -> rusqlite::Result<()> {
    if let Some(album) = &song.album {
        upsert_album(conn, album.id, &album.mid, &album.name, None)?;
    }
    conn.execute(
        "INSERT INTO songs (id, mid, name, album_id, size_128, size_320, size_flac, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            mid = excluded.mid,
            name = excluded.name,
            album_id = excluded.album_id,
            size_128 = excluded.size_128,
            size_320 = excluded.size_320,
            size_flac = excluded.size_flac,
            updated_at = excluded.updated_at",
        rusqlite::params![
            song.id,
            &song.mid,
            &song.name,
            song.album.as_ref().map(|a| a.id),
            song.size128 as i64,
            song.size320 as i64,
            song.size_flac as i64,
            now,
        ],
    )?;
    conn.execute("DELETE FROM song_artists WHERE song_id = ?1", [song.id])?;
    for (position, artist) in song.artists.iter().enumerate() {
        upsert_artist(conn, artist)?;
        conn.execute(
            "INSERT OR IGNORE INTO song_artists (song_id, artist_id, position) VALUES (?1, ?2, ?3)",
            rusqlite::params![song.id, artist.id, position as i64],
        )?;
    }
    Ok(())
}

fn artists_by_song(conn: &Connection) -> rusqlite::Result<HashMap<i64, Vec<String>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sa.song_id, ar.name FROM song_artists sa
         JOIN artists ar ON ar.id = sa.artist_id
         ORDER BY sa.song_id, sa.position",
    )?;
    let mut map: HashMap<i64, Vec<String>> = HashMap::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (song_id, name) = row?;
        map.entry(song_id).or_default().push(name);
    }
    Ok(map)
}

/// Columns: song id, mid, name, album id, album name, starting at `offset`.
fn row_to_song(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<SongRecord> {
    Ok(SongRecord {
        id: row.get(offset)?,
        mid: row.get(offset + 1)?,
        name: row.get(offset + 2)?,
        album_id: row.get(offset + 3)?,
        album_name: row.get(offset + 4)?,
        artists: Vec::new(),
    })
}

const AUDIO_COLUMNS: &str = "l.id, l.path, l.mime_type, s.id, s.mid, s.name, s.album_id, a.name";

fn row_to_audio(row: &rusqlite::Row<'_>, bitrate: Bitrate) -> rusqlite::Result<AudioRecord> {
    Ok(AudioRecord {
        local_id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        mime_type: row.get(2)?,
        bitrate,
        song: row_to_song(row, 3)?,
    })
}

fn query_audios(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    bitrate: Bitrate,
) -> rusqlite::Result<Vec<AudioRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut audios = stmt
        .query_map(params, |row| row_to_audio(row, bitrate))?
        .collect::<Result<Vec<_>, _>>()?;
    let artists = artists_by_song(conn)?;
    for audio in &mut audios {
        audio.song.artists = artists.get(&audio.song.id).cloned().unwrap_or_default();
    }
    Ok(audios)
}

fn count(conn: &Connection, sql: &str) -> Result<u64, StateError> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|n| n as u64)
        .map_err(StateError::query)
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn replace_playlist(
        &self,
        playlist: &Playlist,
        songs: &[Song],
    ) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO playlists (id, name, song_count, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    song_count = excluded.song_count,
                    updated_at = excluded.updated_at",
                rusqlite::params![playlist.id, &playlist.name, songs.len() as i64, now],
            )?;
            tx.execute(
                "DELETE FROM playlist_songs WHERE playlist_id = ?1",
                [playlist.id],
            )?;
            for (position, song) in songs.iter().enumerate() {
                upsert_song(tx, song, now)?;
                tx.execute(
                    "INSERT INTO playlist_songs (playlist_id, song_id, position) VALUES (?1, ?2, ?3)",
                    rusqlite::params![playlist.id, song.id, position as i64],
                )?;
            }
            Ok(())
        })
    }

    async fn prune_playlists(&self, keep: &[i64]) -> Result<u64, StateError> {
        let keep: HashSet<i64> = keep.iter().copied().collect();
        self.with_transaction(|tx| {
            let ids = tx
                .prepare("SELECT id FROM playlists")?
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut removed = 0;
            for id in ids.into_iter().filter(|id| !keep.contains(id)) {
                tx.execute("DELETE FROM playlist_songs WHERE playlist_id = ?1", [id])?;
                tx.execute("DELETE FROM playlists WHERE id = ?1", [id])?;
                removed += 1;
            }
            Ok(removed)
        })
    }

    async fn follow_albums(&self, albums: &[Album]) -> Result<(), StateError> {
        self.with_transaction(|tx| {
            tx.execute("UPDATE albums SET followed = 0 WHERE followed = 1", [])?;
            for album in albums {
                if let Some(artist) = &album.artist {
                    upsert_artist(tx, artist)?;
                }
                upsert_album(
                    tx,
                    album.id,
                    &album.mid,
                    &album.name,
                    album.artist.as_ref().map(|a| a.id),
                )?;
                tx.execute("UPDATE albums SET followed = 1 WHERE id = ?1", [album.id])?;
            }
            Ok(())
        })
    }

    async fn get_playlists(&self) -> Result<Vec<PlaylistRecord>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT id, name, song_count FROM playlists ORDER BY name, id")
            .map_err(StateError::query)?;
        let playlists = stmt
            .query_map([], |row| {
                Ok(PlaylistRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    song_count: row.get(2)?,
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(playlists)
    }

    async fn get_playlist_audios(
        &self,
        playlist_id: i64,
        bitrate: Bitrate,
    ) -> Result<Vec<AudioRecord>, StateError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {AUDIO_COLUMNS} FROM playlist_songs ps
             JOIN songs s ON s.id = ps.song_id
             JOIN locals l ON l.song_id = s.id AND l.bitrate = ?2
             LEFT JOIN albums a ON a.id = s.album_id
             WHERE ps.playlist_id = ?1
             ORDER BY ps.position"
        );
        query_audios(
            &conn,
            &sql,
            rusqlite::params![playlist_id, bitrate.as_str()],
            bitrate,
        )
        .map_err(StateError::query)
    }

    async fn songs_missing_audio(&self, bitrate: Bitrate) -> Result<Vec<SongRecord>, StateError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT s.id, s.mid, s.name, s.album_id, a.name FROM songs s
             LEFT JOIN albums a ON a.id = s.album_id
             WHERE s.{size} > 0
               AND EXISTS (SELECT 1 FROM playlist_songs ps WHERE ps.song_id = s.id)
               AND NOT EXISTS (
                   SELECT 1 FROM locals l WHERE l.song_id = s.id AND l.bitrate = ?1
               )
             ORDER BY s.id",
            size = size_column(bitrate)
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(StateError::query)?;
        let mut songs = stmt
            .query_map([bitrate.as_str()], |row| row_to_song(row, 0))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        let artists = artists_by_song(&conn).map_err(StateError::query)?;
        for song in &mut songs {
            song.artists = artists.get(&song.id).cloned().unwrap_or_default();
        }
        Ok(songs)
    }

    async fn add_audio(
        &self,
        song_id: i64,
        bitrate: Bitrate,
        path: &Path,
    ) -> Result<i64, StateError> {
        let now = Utc::now().timestamp();
        let conn = self.lock()?;
        // REPLACE clears both a previous row for this path and a previous
        // file for this song variant.
        conn.execute(
            "INSERT OR REPLACE INTO locals (path, mime_type, song_id, bitrate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                path.to_string_lossy(),
                bitrate.mime_type(),
                song_id,
                bitrate.as_str(),
                now
            ],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_audios(&self, bitrate: Bitrate) -> Result<Vec<AudioRecord>, StateError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {AUDIO_COLUMNS} FROM locals l
             JOIN songs s ON s.id = l.song_id
             LEFT JOIN albums a ON a.id = s.album_id
             WHERE l.bitrate = ?1
             ORDER BY l.id"
        );
        query_audios(&conn, &sql, [bitrate.as_str()], bitrate).map_err(StateError::query)
    }

    async fn albums_missing_artwork(&self) -> Result<Vec<AlbumRecord>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT a.id, a.mid, a.name FROM albums a
                 WHERE a.artwork_id IS NULL
                   AND (a.followed = 1 OR EXISTS (
                       SELECT 1 FROM songs s
                       JOIN playlist_songs ps ON ps.song_id = s.id
                       WHERE s.album_id = a.id
                   ))
                 ORDER BY a.id",
            )
            .map_err(StateError::query)?;
        let albums = stmt
            .query_map([], |row| {
                Ok(AlbumRecord {
                    id: row.get(0)?,
                    mid: row.get(1)?,
                    name: row.get(2)?,
                    artwork_path: None,
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(albums)
    }

    async fn set_album_artwork(&self, album_id: i64, path: &Path) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO locals (path, mime_type, created_at) VALUES (?1, 'image/jpeg', ?2)",
                rusqlite::params![path.to_string_lossy(), now],
            )?;
            let local_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE albums SET artwork_id = ?1 WHERE id = ?2",
                [local_id, album_id],
            )?;
            Ok(())
        })
    }

    async fn start_sync_run(&self) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(
        &self,
        run_id: i64,
        stats: &SyncRunStats,
    ) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, steps_succeeded = ?2, steps_failed = ?3,
                units_succeeded = ?4, units_failed = ?5, interrupted = ?6 WHERE id = ?7",
            rusqlite::params![
                completed_at,
                stats.steps_succeeded as i64,
                stats.steps_failed as i64,
                stats.units_succeeded as i64,
                stats.units_failed as i64,
                stats.interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn get_summary(&self) -> Result<StoreSummary, StateError> {
        let conn = self.lock()?;
        let playlists = count(&conn, "SELECT COUNT(*) FROM playlists")?;
        let songs = count(&conn, "SELECT COUNT(DISTINCT song_id) FROM playlist_songs")?;
        let followed_albums = count(&conn, "SELECT COUNT(*) FROM albums WHERE followed = 1")?;
        let audio_files = count(&conn, "SELECT COUNT(*) FROM locals WHERE song_id IS NOT NULL")?;
        let artworks = count(&conn, "SELECT COUNT(*) FROM albums WHERE artwork_id IS NOT NULL")?;

        let last_sync: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        let (started, completed) = last_sync.unwrap_or((None, None));

        Ok(StoreSummary {
            playlists,
            songs,
            followed_albums,
            audio_files,
            artworks,
            last_sync_started: started.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            last_sync_completed: completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        })
    }
}
