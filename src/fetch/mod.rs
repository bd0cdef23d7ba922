//! Resumable file acquisition.
//!
//! Every artifact is written to a process-unique staging file and renamed
//! onto its final path only after the full body was written and synced.
//! A failure or crash at any point leaves at most a stale staging file;
//! the final path is either absent or holds its previous complete version.

mod error;
pub mod paths;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub use error::FetchError;

use crate::catalog::{CatalogError, RemoteStream};
use crate::progress::TransferProgress;

/// Longest silence tolerated between two body chunks.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Staging files untouched this long belong to no live transfer.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Where one remote resource lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    /// Identity used in logs and progress reports.
    pub key: String,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
}

impl FetchTarget {
    pub fn new(key: impl Into<String>, final_path: PathBuf) -> Self {
        let temp_path = paths::temp_path(&final_path);
        Self {
            key: key.into(),
            final_path,
            temp_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Bytes are stored as received.
    None,
    /// Decode, scale to `width` pixels wide keeping the aspect ratio, and
    /// re-encode as JPEG.
    Jpeg { width: u32 },
}

/// Pipe `remote` into `target`, applying `transform`, and rename into
/// place. Returns the number of bytes stored.
pub async fn fetch_to_file(
    remote: RemoteStream,
    target: &FetchTarget,
    transform: Transform,
    progress: &dyn TransferProgress,
) -> Result<u64, FetchError> {
    if let Some(parent) = target.final_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(FetchError::disk(parent))?;
    }

    progress.begin(&target.key, remote.content_length);
    let result = stage(remote, target, transform, progress).await;
    progress.finish(&target.key, result.is_ok());
    let written = result?;

    fs::rename(&target.temp_path, &target.final_path)
        .await
        .map_err(FetchError::disk(&target.final_path))?;
    tracing::debug!(
        key = %target.key,
        path = %target.final_path.display(),
        bytes = written,
        "Fetched"
    );
    Ok(written)
}

async fn stage(
    remote: RemoteStream,
    target: &FetchTarget,
    transform: Transform,
    progress: &dyn TransferProgress,
) -> Result<u64, FetchError> {
    let temp = &target.temp_path;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp)
        .await
        .map_err(FetchError::disk(temp))?;

    let pumped = pump(remote, &mut file, target, transform, progress).await;
    // Whatever was received reaches the staging file, even on failure.
    let flushed = file.flush().await.map_err(FetchError::disk(temp));
    let written = pumped?;
    flushed?;
    file.sync_all().await.map_err(FetchError::disk(temp))?;
    Ok(written)
}

/// Next body chunk, or an error if the remote side stays silent for
/// [`STALL_TIMEOUT`].
async fn next_chunk(
    body: &mut BoxStream<'static, Result<Bytes, CatalogError>>,
    key: &str,
) -> Result<Option<Bytes>, FetchError> {
    match tokio::time::timeout(STALL_TIMEOUT, body.next()).await {
        Err(_) => Err(FetchError::Stalled {
            key: key.to_string(),
            after: STALL_TIMEOUT,
        }),
        Ok(None) => Ok(None),
        Ok(Some(chunk)) => chunk.map(Some).map_err(|source| FetchError::Remote {
            key: key.to_string(),
            source,
        }),
    }
}

async fn pump(
    remote: RemoteStream,
    file: &mut fs::File,
    target: &FetchTarget,
    transform: Transform,
    progress: &dyn TransferProgress,
) -> Result<u64, FetchError> {
    let mut body = remote.body;
    let temp = &target.temp_path;
    match transform {
        Transform::None => {
            let mut written: u64 = 0;
            while let Some(chunk) = next_chunk(&mut body, &target.key).await? {
                file.write_all(&chunk).await.map_err(FetchError::disk(temp))?;
                written += chunk.len() as u64;
                progress.advance(&target.key, chunk.len() as u64);
            }
            Ok(written)
        }
        Transform::Jpeg { width } => {
            // Decoders need the whole image anyway.
            let mut raw = Vec::new();
            while let Some(chunk) = next_chunk(&mut body, &target.key).await? {
                raw.extend_from_slice(&chunk);
                progress.advance(&target.key, chunk.len() as u64);
            }
            let encoded = tokio::task::spawn_blocking(move || reencode_jpeg(&raw, width))
                .await?
                .map_err(|source| FetchError::Transform {
                    key: target.key.clone(),
                    source,
                })?;
            file.write_all(&encoded).await.map_err(FetchError::disk(temp))?;
            Ok(encoded.len() as u64)
        }
    }
}

pub fn reencode_jpeg(raw: &[u8], width: u32) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(raw)?;
    let scaled = img.resize(width, u32::MAX, FilterType::Lanczos3);
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(scaled.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

/// Replace `path` with `contents` through a staging file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(FetchError::disk(parent))?;
    }
    let temp = paths::temp_path(path);
    let mut file = fs::File::create(&temp)
        .await
        .map_err(FetchError::disk(&temp))?;
    file.write_all(contents)
        .await
        .map_err(FetchError::disk(&temp))?;
    file.sync_all().await.map_err(FetchError::disk(&temp))?;
    drop(file);
    fs::rename(&temp, path).await.map_err(FetchError::disk(path))
}

/// Copy a local file onto `dest` through a staging file next to `dest`.
pub async fn copy_atomic(
    src: &Path,
    dest: &Path,
    key: &str,
    progress: &dyn TransferProgress,
) -> Result<u64, FetchError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(FetchError::disk(parent))?;
    }
    let temp = paths::temp_path(dest);
    let total = fs::metadata(src).await.map(|m| m.len()).ok();
    progress.begin(key, total);
    let copied = async {
        let n = fs::copy(src, &temp).await.map_err(FetchError::disk(src))?;
        fs::File::open(&temp)
            .await
            .map_err(FetchError::disk(&temp))?
            .sync_all()
            .await
            .map_err(FetchError::disk(&temp))?;
        Ok::<u64, FetchError>(n)
    }
    .await;
    if let Ok(n) = copied {
        progress.advance(key, n);
    }
    progress.finish(key, copied.is_ok());
    let n = copied?;
    fs::rename(&temp, dest).await.map_err(FetchError::disk(dest))?;
    Ok(n)
}

/// Remove staging files in `dir` left behind by crashed or killed runs.
/// Younger ones may belong to another process sharing the workdir.
pub async fn sweep_stale_temps(dir: &Path) -> Result<usize, FetchError> {
    let mut entries = match fs::read_dir(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        other => other.map_err(FetchError::disk(dir))?,
    };
    let Some(cutoff) = SystemTime::now().checked_sub(STALE_TEMP_AGE) else {
        return Ok(0);
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await.map_err(FetchError::disk(dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !paths::is_temp_name(&name) {
            continue;
        }
        let modified = entry.metadata().await.and_then(|m| m.modified());
        if !matches!(modified, Ok(at) if at < cutoff) {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                tracing::debug!(file = %name, "Removed stale staging file");
                removed += 1;
            }
            Err(e) => tracing::warn!(file = %name, error = %e, "Failed to remove staging file"),
        }
    }
    Ok(removed)
}
