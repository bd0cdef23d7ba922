//! Device sync: mirror the local library of the configured variant onto a
//! mounted player.
//!
//! Audio lands flat in `MUSIC/walkman-go/` on the device, and one playlist
//! file per stored playlist is written to `MUSIC/` once the copies are done.
//! `MUSIC/` is shared with whatever else the owner puts on the player, so
//! only playlist files listed in the library's manifest are ever removed.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use super::m3u::{playlist_file_name, render};
use super::{drive, JobContext};
use crate::fetch::{copy_atomic, write_atomic};
use crate::scheduler::presence::Device;
use crate::state::AudioRecord;

pub const MUSIC_DIR: &str = "MUSIC";
pub const LIBRARY_DIR: &str = "walkman-go";
/// Names of the playlist files the last sync wrote to `MUSIC/`, one per line.
pub const PLAYLIST_MANIFEST: &str = ".playlists";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub copied: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub removed: usize,
    pub playlists: usize,
    pub interrupted: bool,
}

impl TransferSummary {
    pub fn log(&self, device: &str) {
        tracing::info!("── Device Sync Summary ({device}) ──");
        tracing::info!(
            "  {} copied, {} up to date, {} failed",
            self.copied,
            self.up_to_date,
            self.failed
        );
        tracing::info!(
            "  {} removed, {} playlists written",
            self.removed,
            self.playlists
        );
        if self.interrupted {
            tracing::info!("  interrupted by shutdown");
        }
    }
}

fn file_name(audio: &AudioRecord) -> Option<String> {
    audio
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Delete everything in `library` that is not in `desired`, staging files
/// from interrupted copies included.
async fn remove_undesired(library: &Path, desired: &HashSet<String>) -> anyhow::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(library)
        .await
        .with_context(|| format!("Failed to list {}", library.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if desired.contains(&name) || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                tracing::debug!(file = %name, "Removed from device");
                removed += 1;
            }
            Err(e) => tracing::warn!(file = %name, error = %e, "Failed to remove from device"),
        }
    }
    Ok(removed)
}

async fn read_manifest(path: &Path) -> anyhow::Result<HashSet<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Remove playlists a previous sync wrote that this one did not.
async fn remove_dropped_playlists(
    music: &Path,
    previous: &HashSet<String>,
    written: &HashSet<String>,
) -> usize {
    let mut removed = 0;
    for name in previous.difference(written) {
        // A bare file name only; anything else did not come from us.
        if Path::new(name).file_name() != Some(OsStr::new(name)) {
            continue;
        }
        match tokio::fs::remove_file(music.join(name)).await {
            Ok(()) => {
                tracing::debug!(playlist = %name, "Removed dropped playlist from device");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(playlist = %name, error = %e, "Failed to remove playlist"),
        }
    }
    removed
}

pub async fn sync_device(
    ctx: &JobContext,
    device: &Device,
    cancel: &CancellationToken,
) -> anyhow::Result<TransferSummary> {
    let Some(mount) = device.mountpoints.first() else {
        anyhow::bail!("device {} has no mountpoint", device.name);
    };
    if device.mountpoints.len() > 1 {
        tracing::info!(
            using = %mount.display(),
            ignored = device.mountpoints.len() - 1,
            "Device has several mountpoints, using the first"
        );
    }
    let music = mount.join(MUSIC_DIR);
    let library = music.join(LIBRARY_DIR);
    tokio::fs::create_dir_all(&library)
        .await
        .with_context(|| format!("Failed to create {}", library.display()))?;

    let variant = ctx.settings.variant;
    let playlists = ctx
        .db
        .get_playlists()
        .await
        .context("Failed to list playlists")?;
    let mut members = Vec::with_capacity(playlists.len());
    let mut desired: BTreeMap<String, PathBuf> = BTreeMap::new();
    for playlist in playlists {
        let audios = ctx
            .db
            .get_playlist_audios(playlist.id, variant)
            .await
            .with_context(|| format!("Failed to list audio of {}", playlist.name))?;
        for audio in &audios {
            if let Some(name) = file_name(audio) {
                desired.insert(name, audio.path.clone());
            }
        }
        members.push((playlist, audios));
    }
    tracing::info!(
        device = %device.name,
        files = desired.len(),
        playlists = members.len(),
        "Syncing device"
    );

    let mut summary = TransferSummary::default();
    let processor = ctx.processor();
    for (name, src) in &desired {
        let dest = library.join(name);
        let (src_len, dest_len) = (file_len(src).await, file_len(&dest).await);
        if src_len.is_some() && src_len == dest_len {
            summary.up_to_date += 1;
            continue;
        }
        let src = src.clone();
        let key = name.clone();
        let progress = ctx.progress.clone();
        let cancel = cancel.clone();
        processor.add(move || async move {
            if cancel.is_cancelled() {
                anyhow::bail!("shutdown requested before copying {key}");
            }
            copy_atomic(&src, &dest, &key, progress.as_ref()).await?;
            Ok(())
        });
    }
    let copies = drive(ctx, "transfer", &processor).await?;
    summary.copied = copies.succeeded;
    summary.failed = copies.failed;

    if cancel.is_cancelled() {
        summary.interrupted = true;
        return Ok(summary);
    }

    let mut names: HashSet<String> = desired.into_keys().collect();
    names.insert(PLAYLIST_MANIFEST.to_string());
    summary.removed = remove_undesired(&library, &names).await?;

    // Playlists last, so the player never indexes entries whose files are
    // still being copied.
    let mut written = HashSet::new();
    for (playlist, audios) in &members {
        let file = playlist_file_name(&playlist.name);
        let contents = render(audios, |audio| {
            format!("{LIBRARY_DIR}/{}", file_name(audio).unwrap_or_default())
        });
        match write_atomic(&music.join(&file), contents.as_bytes()).await {
            Ok(()) => summary.playlists += 1,
            Err(e) => tracing::warn!(playlist = %playlist.name, error = %e, "Failed to write playlist"),
        }
        written.insert(file);
    }
    let manifest = library.join(PLAYLIST_MANIFEST);
    let previous = read_manifest(&manifest).await?;
    summary.removed += remove_dropped_playlists(&music, &previous, &written).await;

    let mut listed: Vec<&str> = written.iter().map(String::as_str).collect();
    listed.sort_unstable();
    let mut contents = listed.join("\n");
    contents.push('\n');
    write_atomic(&manifest, contents.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", manifest.display()))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Playlist;
    use crate::jobs::audio::fetch_audio;
    use crate::jobs::playlists::fetch_playlists;
    use crate::jobs::testing::{song, FakeCatalog, TestEnv};

    async fn env_with_library() -> TestEnv {
        let mut catalog = FakeCatalog::default();
        catalog.add_playlist(
            Playlist {
                id: 1,
                name: "Mix".into(),
                song_count: 2,
            },
            vec![song(10, "a", 5), song(11, "b", 5)],
        );
        catalog.add_playlist(
            Playlist {
                id: 2,
                name: "Solo".into(),
                song_count: 1,
            },
            vec![song(11, "b", 5)],
        );
        let env = TestEnv::new(catalog);
        fetch_playlists(&env.ctx).await.unwrap();
        fetch_audio(&env.ctx).await.unwrap();
        env
    }

    fn device(mount: &Path) -> Device {
        Device {
            name: "WALKMAN".into(),
            mountpoints: vec![mount.to_path_buf()],
        }
    }

    #[tokio::test]
    async fn test_sync_copies_prunes_and_writes_playlists() {
        let env = env_with_library().await;
        let mount = tempfile::tempdir().unwrap();
        let library = mount.path().join(MUSIC_DIR).join(LIBRARY_DIR);
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(library.join("old.320.mp3"), b"gone").unwrap();
        std::fs::write(library.join("a.320.mp3.4242.tmp"), b"partial").unwrap();
        std::fs::write(mount.path().join(MUSIC_DIR).join("Old.m3u"), b"#EXTM3U\n").unwrap();

        let summary = sync_device(&env.ctx, &device(mount.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.playlists, 2);
        assert_eq!(summary.removed, 2);
        assert!(!summary.interrupted);

        let mut files: Vec<_> = std::fs::read_dir(&library)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec![PLAYLIST_MANIFEST, "a.320.mp3", "b.320.mp3"]);

        let solo = std::fs::read_to_string(mount.path().join(MUSIC_DIR).join("Solo.m3u")).unwrap();
        assert!(solo.contains("walkman-go/b.320.mp3\n"));
        // Not ours: left alone.
        assert!(mount.path().join(MUSIC_DIR).join("Old.m3u").exists());

        // Nothing changed since: everything is up to date.
        let again = sync_device(&env.ctx, &device(mount.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.copied, 0);
        assert_eq!(again.up_to_date, 2);
        assert_eq!(again.removed, 0);
    }

    #[tokio::test]
    async fn test_only_playlists_written_here_are_removed() {
        let env = env_with_library().await;
        let mount = tempfile::tempdir().unwrap();
        let music = mount.path().join(MUSIC_DIR);
        let library = music.join(LIBRARY_DIR);
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(music.join("Gone.m3u"), b"#EXTM3U\n").unwrap();
        std::fs::write(music.join("Mine.m3u"), b"#EXTM3U\n").unwrap();
        std::fs::write(
            library.join(PLAYLIST_MANIFEST),
            "Gone.m3u\nMix.m3u\n../escape.m3u\n",
        )
        .unwrap();
        std::fs::write(mount.path().join("escape.m3u"), b"#EXTM3U\n").unwrap();

        let summary = sync_device(&env.ctx, &device(mount.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert!(!music.join("Gone.m3u").exists());
        assert!(music.join("Mine.m3u").exists());
        assert!(music.join("Mix.m3u").exists());
        assert!(mount.path().join("escape.m3u").exists());
        assert_eq!(
            std::fs::read_to_string(library.join(PLAYLIST_MANIFEST)).unwrap(),
            "Mix.m3u\nSolo.m3u\n"
        );
    }

    #[tokio::test]
    async fn test_size_mismatch_is_recopied() {
        let env = env_with_library().await;
        let mount = tempfile::tempdir().unwrap();
        let library = mount.path().join(MUSIC_DIR).join(LIBRARY_DIR);
        std::fs::create_dir_all(&library).unwrap();
        std::fs::write(library.join("a.320.mp3"), b"truncated").unwrap();

        let summary = sync_device(&env.ctx, &device(mount.path()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.copied, 2);
        let local = std::fs::read(env.ctx.settings.audio_dir.join("a.320.mp3")).unwrap();
        assert_eq!(std::fs::read(library.join("a.320.mp3")).unwrap(), local);
    }

    #[tokio::test]
    async fn test_cancelled_sync_skips_cleanup() {
        let env = env_with_library().await;
        let mount = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = sync_device(&env.ctx, &device(mount.path()), &cancel)
            .await
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.failed, 2);
        assert!(!mount.path().join(MUSIC_DIR).join("Mix.m3u").exists());
    }

    #[tokio::test]
    async fn test_device_without_mountpoint_fails() {
        let env = env_with_library().await;
        let device = Device {
            name: "WALKMAN".into(),
            mountpoints: Vec::new(),
        };
        assert!(sync_device(&env.ctx, &device, &CancellationToken::new())
            .await
            .is_err());
    }
}
