//! QQ Music web API client.
//!
//! Every JSON endpoint answers HTTP 200 with a `code` field; non-zero codes
//! are surfaced as [`CatalogError::Api`]. Response parsing is kept separate
//! from transport so it can be exercised with fixtures.

use std::future::Future;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::REFERER;
use serde::Deserialize;
use serde_json::Value;

use super::{Album, AlbumRef, Artist, Catalog, CatalogError, Playlist, RemoteStream, Song};
use crate::types::Bitrate;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ALBUM_PAGE_SIZE: u32 = 50;
/// Upper bound on album pages per listing; the API has been seen to keep
/// reporting `has_more` past the end.
const MAX_ALBUM_PAGES: u32 = 200;
const REFERER_URL: &str = "https://y.qq.com/";

const PLAYLISTS_URL: &str = "https://c.y.qq.com/rsc/fcgi-bin/fcg_user_created_diss";
const PLAYLIST_SONGS_URL: &str = "https://c.y.qq.com/qzone/fcg-bin/fcg_ucc_getcdinfo_byids_cp.fcg";
const ALBUMS_URL: &str = "https://c.y.qq.com/fav/fcgi-bin/fcg_get_profile_order_asset.fcg";
const KEY_URL: &str = "https://c.y.qq.com/base/fcgi-bin/fcg_musicexpress.fcg";
/// Songs whose mid starts with `1` are only served from this host.
const LEGACY_AUDIO_HOST: &str = "http://124.14.5.142/musicoc.music.tc.qq.com/";

pub struct QqMusicClient {
    http: reqwest::Client,
}

impl QqMusicClient {
    pub fn new() -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    async fn get_json(&self, endpoint: &'static str, url: &str) -> Result<Value, CatalogError> {
        tracing::debug!(endpoint, url, "Catalog request");
        let resp = self
            .http
            .get(url)
            .header(REFERER, REFERER_URL)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                endpoint,
                body,
            });
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| CatalogError::Json { endpoint, source })
    }

    /// Streams have no total deadline since a large FLAC can take minutes,
    /// but every read is bounded by the client's read timeout.
    async fn get_stream(
        &self,
        endpoint: &'static str,
        url: &str,
    ) -> Result<RemoteStream, CatalogError> {
        let resp = self.http.get(url).header(REFERER, REFERER_URL).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CatalogError::HttpStatus {
                status: status.as_u16(),
                endpoint,
                body,
            });
        }
        Ok(RemoteStream {
            content_length: resp.content_length(),
            body: resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(CatalogError::from))
                .boxed(),
        })
    }
}

#[async_trait::async_trait]
impl Catalog for QqMusicClient {
    async fn playlists(&self, uin: &str) -> Result<Vec<Playlist>, CatalogError> {
        let url = format!("{PLAYLISTS_URL}?hostuin={uin}&size=32&format=json");
        parse_playlists(self.get_json("playlists", &url).await?)
    }

    async fn playlist_songs(&self, playlist_id: i64) -> Result<Vec<Song>, CatalogError> {
        let url = format!("{PLAYLIST_SONGS_URL}?type=1&disstid={playlist_id}&utf8=1&format=json");
        parse_playlist_songs(self.get_json("playlist_songs", &url).await?)
    }

    async fn albums(&self, uin: &str) -> Result<Vec<Album>, CatalogError> {
        collect_album_pages(|offset| async move {
            let url = format!(
                "{ALBUMS_URL}?ct=20&cid=205360956&userid={uin}&reqtype=2&sin={offset}&ein={}",
                offset + ALBUM_PAGE_SIZE - 1
            );
            parse_album_page(self.get_json("albums", &url).await?)
        })
        .await
    }

    async fn audio_stream(
        &self,
        song_mid: &str,
        bitrate: Bitrate,
    ) -> Result<RemoteStream, CatalogError> {
        let guid: u64 = rand::thread_rng().gen_range(0..1_000_000_000);
        let url = format!("{KEY_URL}?guid={guid}&format=json");
        let key = parse_stream_key(self.get_json("stream_key", &url).await?)?;
        let url = audio_url(song_mid, bitrate, &key, guid);
        self.get_stream("audio", &url).await
    }

    async fn artwork_stream(&self, album_id: i64) -> Result<RemoteStream, CatalogError> {
        self.get_stream("artwork", &artwork_url(album_id)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamKey {
    pub key: String,
    pub host: String,
}

pub(crate) struct AlbumPage {
    pub albums: Vec<Album>,
    pub has_more: bool,
}

fn remote_file_name(song_mid: &str, bitrate: Bitrate) -> String {
    match bitrate {
        Bitrate::Flac => format!("F000{song_mid}.flac"),
        Bitrate::Mp3_320 => format!("M800{song_mid}.mp3"),
        Bitrate::Mp3_128 => format!("M500{song_mid}.mp3"),
    }
}

pub(crate) fn audio_url(song_mid: &str, bitrate: Bitrate, key: &StreamKey, guid: u64) -> String {
    let file = remote_file_name(song_mid, bitrate);
    if song_mid.starts_with('1') {
        format!(
            "{LEGACY_AUDIO_HOST}{file}?vkey={}&guid={guid}&fromtag=64",
            key.key
        )
    } else {
        format!("{}{file}?vkey={}&guid={guid}&fromtag=60", key.host, key.key)
    }
}

/// Artwork is sharded by the last two decimal digits of the album id.
pub(crate) fn artwork_url(album_id: i64) -> String {
    format!(
        "https://y.gtimg.cn/music/photo/album_500/{}/500_albumpic_{album_id}_0.jpg",
        album_id % 100
    )
}

// Raw response shapes. Fields the service sometimes omits default to empty.

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Deserialize)]
struct PlaylistsResponse {
    data: PlaylistsData,
}

#[derive(Deserialize)]
struct PlaylistsData {
    #[serde(default)]
    disslist: Vec<RawPlaylist>,
}

#[derive(Deserialize)]
struct RawPlaylist {
    tid: i64,
    #[serde(default)]
    diss_name: String,
    #[serde(default)]
    song_cnt: u32,
}

#[derive(Deserialize)]
struct SongsResponse {
    #[serde(default)]
    cdlist: Vec<RawCd>,
}

#[derive(Deserialize)]
struct RawCd {
    #[serde(default)]
    songlist: Vec<RawSong>,
}

#[derive(Deserialize)]
struct RawSong {
    songid: i64,
    #[serde(rename = "strMediaMid", default)]
    media_mid: String,
    #[serde(default)]
    songname: String,
    #[serde(default)]
    albumid: i64,
    #[serde(default)]
    albummid: String,
    #[serde(default)]
    albumname: String,
    #[serde(default)]
    singer: Vec<RawSinger>,
    #[serde(default)]
    size128: u64,
    #[serde(default)]
    size320: u64,
    #[serde(default)]
    sizeflac: u64,
}

#[derive(Deserialize)]
struct RawSinger {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    mid: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct AlbumsResponse {
    data: AlbumsData,
}

#[derive(Deserialize)]
struct AlbumsData {
    #[serde(default)]
    has_more: Value,
    #[serde(default)]
    albumlist: Vec<RawAlbum>,
}

#[derive(Deserialize)]
struct RawAlbum {
    albumid: i64,
    #[serde(default)]
    albummid: String,
    #[serde(default)]
    albumname: String,
    #[serde(default)]
    singerid: i64,
    #[serde(default)]
    singermid: String,
    #[serde(default)]
    singername: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    #[serde(default)]
    key: String,
    #[serde(default)]
    sip: Vec<String>,
}

fn check_status(endpoint: &'static str, value: &Value) -> Result<(), CatalogError> {
    let status: Status =
        Status::deserialize(value).map_err(|source| CatalogError::Json { endpoint, source })?;
    if status.code != 0 {
        return Err(CatalogError::Api {
            code: status.code,
            endpoint,
            message: status.message.or(status.msg).unwrap_or_default(),
        });
    }
    Ok(())
}

fn decode<T: for<'de> Deserialize<'de>>(
    endpoint: &'static str,
    value: Value,
) -> Result<T, CatalogError> {
    check_status(endpoint, &value)?;
    serde_json::from_value(value).map_err(|source| CatalogError::Json { endpoint, source })
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

pub(crate) fn parse_playlists(value: Value) -> Result<Vec<Playlist>, CatalogError> {
    let resp: PlaylistsResponse = decode("playlists", value)?;
    Ok(resp
        .data
        .disslist
        .into_iter()
        .map(|p| Playlist {
            id: p.tid,
            name: p.diss_name,
            song_count: p.song_cnt,
        })
        .collect())
}

pub(crate) fn parse_playlist_songs(value: Value) -> Result<Vec<Song>, CatalogError> {
    let resp: SongsResponse = decode("playlist_songs", value)?;
    let cd = resp
        .cdlist
        .into_iter()
        .next()
        .ok_or_else(|| CatalogError::Malformed {
            endpoint: "playlist_songs",
            reason: "empty cdlist".into(),
        })?;
    Ok(cd.songlist.into_iter().map(song_from_raw).collect())
}

fn song_from_raw(raw: RawSong) -> Song {
    let album = (raw.albumid != 0).then(|| AlbumRef {
        id: raw.albumid,
        mid: raw.albummid,
        name: raw.albumname,
    });
    let artists = raw
        .singer
        .into_iter()
        .filter(|s| s.id != 0 && !s.mid.is_empty() && !s.name.is_empty())
        .map(|s| Artist {
            id: s.id,
            mid: s.mid,
            name: s.name,
        })
        .collect();
    Song {
        id: raw.songid,
        mid: raw.media_mid,
        name: raw.songname,
        album,
        artists,
        size128: raw.size128,
        size320: raw.size320,
        size_flac: raw.sizeflac,
    }
}

/// Walk album pages from offset zero until one says it is the last, comes
/// back empty, or [`MAX_ALBUM_PAGES`] were read.
async fn collect_album_pages<F, Fut>(mut fetch: F) -> Result<Vec<Album>, CatalogError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<AlbumPage, CatalogError>>,
{
    let mut albums = Vec::new();
    for page_no in 0..MAX_ALBUM_PAGES {
        let page = fetch(page_no * ALBUM_PAGE_SIZE).await?;
        if page.albums.is_empty() {
            return Ok(albums);
        }
        albums.extend(page.albums);
        if !page.has_more {
            return Ok(albums);
        }
    }
    tracing::warn!(
        pages = MAX_ALBUM_PAGES,
        albums = albums.len(),
        "Album listing never reached its last page, keeping what was read"
    );
    Ok(albums)
}

pub(crate) fn parse_album_page(value: Value) -> Result<AlbumPage, CatalogError> {
    let resp: AlbumsResponse = decode("albums", value)?;
    let has_more = truthy(&resp.data.has_more);
    let albums = resp
        .data
        .albumlist
        .into_iter()
        .map(|a| Album {
            id: a.albumid,
            mid: a.albummid,
            name: a.albumname,
            artist: (a.singerid != 0).then_some(Artist {
                id: a.singerid,
                mid: a.singermid,
                name: a.singername,
            }),
        })
        .collect();
    Ok(AlbumPage { albums, has_more })
}

pub(crate) fn parse_stream_key(value: Value) -> Result<StreamKey, CatalogError> {
    let resp: KeyResponse = decode("stream_key", value)?;
    let host = resp
        .sip
        .into_iter()
        .next()
        .ok_or_else(|| CatalogError::Malformed {
            endpoint: "stream_key",
            reason: "no stream host offered".into(),
        })?;
    if resp.key.is_empty() {
        return Err(CatalogError::Malformed {
            endpoint: "stream_key",
            reason: "empty vkey".into(),
        });
    }
    Ok(StreamKey {
        key: resp.key,
        host,
    })
}
