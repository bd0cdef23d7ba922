//! Extended M3U playlist files.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;

use super::{drive, JobContext};
use crate::fetch::paths::sanitize_component;
use crate::fetch::write_atomic;
use crate::processor::ProcessorSummary;
use crate::state::AudioRecord;

pub(crate) fn playlist_file_name(name: &str) -> String {
    format!("{}.m3u", sanitize_component(name))
}

/// Render an extended M3U, one entry per audio file in the given order.
/// `location` maps each file to the path written into the playlist.
pub(crate) fn render(audios: &[AudioRecord], location: impl Fn(&AudioRecord) -> String) -> String {
    let mut out = String::from("#EXTM3U\n");
    for audio in audios {
        let artist = audio
            .song
            .artists
            .first()
            .map(String::as_str)
            .unwrap_or("Unknown");
        out.push_str(&format!("#EXTINF:-1,{} - {}\n", artist, audio.song.name));
        out.push_str(&location(audio));
        out.push('\n');
    }
    out
}

/// Remove `*.m3u` files in `dir` whose name is not in `keep`.
pub(crate) async fn remove_stale(dir: &Path, keep: &HashSet<String>) -> anyhow::Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".m3u") && !keep.contains(&name) {
            tokio::fs::remove_file(entry.path())
                .await
                .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
            tracing::debug!(playlist = %name, "Removed stale playlist file");
            removed += 1;
        }
    }
    Ok(removed)
}

pub(super) async fn build_playlist_files(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let playlists = ctx
        .db
        .get_playlists()
        .await
        .context("Failed to list playlists")?;
    let variant = ctx.settings.variant;
    let dir = ctx.settings.playlists_dir.clone();
    let keep: HashSet<String> = playlists
        .iter()
        .map(|p| playlist_file_name(&p.name))
        .collect();

    let processor = ctx.processor();
    for playlist in playlists {
        let db = ctx.db.clone();
        let path = dir.join(playlist_file_name(&playlist.name));
        processor.add(move || async move {
            let audios = db.get_playlist_audios(playlist.id, variant).await?;
            let contents = render(&audios, |a| a.path.to_string_lossy().into_owned());
            write_atomic(&path, contents.as_bytes()).await?;
            tracing::debug!(
                playlist = %playlist.name,
                entries = audios.len(),
                "Wrote playlist file"
            );
            Ok(())
        });
    }
    processor.post(move || async move {
        let removed = remove_stale(&dir, &keep).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed playlist files no longer synced");
        }
        Ok(())
    });

    drive(ctx, "build-playlist-files", &processor).await
}
