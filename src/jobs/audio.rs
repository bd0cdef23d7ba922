use anyhow::Context;

use super::{drive, JobContext};
use crate::fetch::paths::audio_file_name;
use crate::fetch::{fetch_to_file, FetchError, FetchTarget, Transform};
use crate::processor::ProcessorSummary;

pub(super) async fn fetch_audio(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let variant = ctx.settings.variant;
    let songs = ctx
        .db
        .songs_missing_audio(variant)
        .await
        .context("Failed to list songs without audio")?;
    tracing::info!(count = songs.len(), %variant, "Fetching audio");

    let processor = ctx.processor();
    for song in songs {
        if song.mid.is_empty() {
            tracing::debug!(song_id = song.id, "Song has no mid, skipping");
            continue;
        }
        // Names repeat across songs; the file name does not.
        let file = audio_file_name(&song.mid, variant);
        let target = FetchTarget::new(file.clone(), ctx.settings.audio_dir.join(file));
        let catalog = ctx.catalog.clone();
        let db = ctx.db.clone();
        let progress = ctx.progress.clone();
        let handle = processor.clone();
        processor.add(move || async move {
            // A crash between rename and record leaves the file in place.
            let on_disk = tokio::fs::try_exists(&target.final_path)
                .await
                .unwrap_or(false);
            if on_disk {
                tracing::debug!(path = %target.final_path.display(), "Audio already on disk, recording");
            } else {
                let remote = catalog
                    .audio_stream(&song.mid, variant)
                    .await
                    .map_err(|source| FetchError::Remote {
                        key: target.key.clone(),
                        source,
                    })?;
                fetch_to_file(remote, &target, Transform::None, progress.as_ref()).await?;
            }
            handle.post(move || async move {
                db.add_audio(song.id, variant, &target.final_path)
                    .await
                    .with_context(|| format!("Failed to record {}", target.final_path.display()))?;
                Ok(())
            });
            Ok(())
        });
    }
    drive(ctx, "fetch-audio", &processor).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::catalog::Playlist;
    use crate::jobs::playlists::fetch_playlists;
    use crate::jobs::testing::{song, FakeCatalog, TestEnv};
    use crate::state::StateDb;
    use crate::types::Bitrate;

    fn catalog_with(songs: Vec<crate::catalog::Song>) -> FakeCatalog {
        let mut catalog = FakeCatalog::default();
        catalog.add_playlist(
            Playlist {
                id: 1,
                name: "Mix".into(),
                song_count: songs.len() as u32,
            },
            songs,
        );
        catalog
    }

    #[tokio::test]
    async fn test_fetches_missing_audio_and_records_it() {
        // Size 0: not offered in this variant.
        let catalog = catalog_with(vec![song(10, "a", 5), song(11, "b", 5), song(12, "c", 0)]);
        let env = TestEnv::new(catalog);
        fetch_playlists(&env.ctx).await.unwrap();

        let summary = fetch_audio(&env.ctx).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.effects_succeeded, 2);

        let audios = env.db.get_audios(Bitrate::Mp3_320).await.unwrap();
        assert_eq!(audios.len(), 2);
        for audio in &audios {
            assert!(audio.path.exists());
            assert_eq!(audio.mime_type, "audio/mpeg");
        }
        assert!(env
            .ctx
            .settings
            .audio_dir
            .join("a.320.mp3")
            .exists());

        // Second run has nothing to do.
        let summary = fetch_audio(&env.ctx).await.unwrap();
        assert_eq!(summary.settled(), 0);
        assert_eq!(env.catalog.audio_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_file_left_by_crash_is_only_recorded() {
        let env = TestEnv::new(catalog_with(vec![song(10, "a", 5)]));
        fetch_playlists(&env.ctx).await.unwrap();
        let audio_dir = &env.ctx.settings.audio_dir;
        std::fs::create_dir_all(audio_dir).unwrap();
        std::fs::write(audio_dir.join("a.320.mp3"), b"previous run").unwrap();

        let summary = fetch_audio(&env.ctx).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(env.catalog.audio_calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.db.get_audios(Bitrate::Mp3_320).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_is_retried_next_run() {
        let mut catalog = catalog_with(vec![song(10, "a", 5), song(11, "b", 5)]);
        catalog.broken_audio.push("b".into());
        let env = TestEnv::new(catalog);
        fetch_playlists(&env.ctx).await.unwrap();

        let summary = fetch_audio(&env.ctx).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!env.ctx.settings.audio_dir.join("b.320.mp3").exists());

        let missing = env.db.songs_missing_audio(Bitrate::Mp3_320).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].mid, "b");
    }
}
