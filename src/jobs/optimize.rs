//! Tag normalization over the local audio of one variant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;

use super::{drive, JobContext};
use crate::processor::ProcessorSummary;
use crate::state::{AudioRecord, SongRecord};
use crate::tags::{AudioFormat, TagCodec, TagError, TagFields};
use crate::types::Bitrate;

const UNKNOWN: &str = "Unknown";

/// Where the album tag comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumSource {
    /// A fixed value, so players group nothing by album.
    Placeholder(String),
    /// The catalog's album name, falling back to the placeholder.
    FromCatalog,
}

impl AlbumSource {
    pub fn placeholder() -> Self {
        AlbumSource::Placeholder(UNKNOWN.to_string())
    }
}

/// Which files get normalized and what is written into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeConfig {
    pub variant: Bitrate,
    pub album: AlbumSource,
}

impl NormalizeConfig {
    pub fn fields_for(&self, song: &SongRecord) -> TagFields {
        let album = match &self.album {
            AlbumSource::Placeholder(value) => value.clone(),
            AlbumSource::FromCatalog => song
                .album_name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()),
        };
        TagFields {
            title: song.name.clone(),
            artist: song
                .artists
                .first()
                .cloned()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            album,
            variant: self.variant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Already carried the marker for this variant.
    Skipped,
    Rewritten,
}

/// Read one file's tag state and rewrite it unless it is already marked
/// for the configured variant.
pub async fn normalize_file(
    codec: Arc<dyn TagCodec>,
    audio: &AudioRecord,
    config: &NormalizeConfig,
) -> Result<NormalizeOutcome, TagError> {
    let format = AudioFormat::from_mime(&audio.mime_type)
        .ok_or_else(|| TagError::UnsupportedFormat(audio.mime_type.clone()))?;
    let path = audio.path.clone();
    let fields = config.fields_for(&audio.song);

    tokio::task::spawn_blocking(move || -> Result<NormalizeOutcome, TagError> {
        let state = codec.read_state(&path, format)?;
        if state.optimized && state.variant.as_deref() == Some(fields.variant.as_str()) {
            tracing::debug!(path = %path.display(), "Tags already normalized");
            return Ok(NormalizeOutcome::Skipped);
        }
        codec.write(&path, format, &fields)?;
        tracing::debug!(path = %path.display(), title = %fields.title, "Tags normalized");
        Ok(NormalizeOutcome::Rewritten)
    })
    .await?
}

pub(super) async fn optimize_tags(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let config = ctx.settings.normalize();
    let audios = ctx
        .db
        .get_audios(config.variant)
        .await
        .context("Failed to list local audio")?;

    let processor = ctx.processor();
    let rewritten = Arc::new(AtomicUsize::new(0));
    for audio in audios
        .into_iter()
        .filter(|audio| audio.bitrate == config.variant)
    {
        let codec = ctx.codec.clone();
        let config = config.clone();
        let rewritten = rewritten.clone();
        processor.add(move || async move {
            let outcome = normalize_file(codec, &audio, &config)
                .await
                .with_context(|| format!("Failed to normalize {}", audio.path.display()))?;
            if outcome == NormalizeOutcome::Rewritten {
                rewritten.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });
    }

    let summary = drive(ctx, "optimize-tags", &processor).await?;
    tracing::info!(
        rewritten = rewritten.load(Ordering::Relaxed),
        variant = %config.variant,
        "Tag normalization done"
    );
    Ok(summary)
}
