use anyhow::Context;

use super::{drive, JobContext};
use crate::catalog::Playlist;
use crate::processor::ProcessorSummary;

/// Keep the playlists named in `filter`, or all of them when it is empty.
fn select_playlists(all: Vec<Playlist>, filter: &[String]) -> Vec<Playlist> {
    if filter.is_empty() {
        return all;
    }
    for name in filter {
        if !all.iter().any(|p| &p.name == name) {
            tracing::warn!(playlist = %name, "Configured playlist not found");
        }
    }
    all.into_iter()
        .filter(|p| filter.iter().any(|name| name == &p.name))
        .collect()
}

pub(super) async fn fetch_playlists(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let all = ctx
        .catalog
        .playlists(&ctx.settings.uin)
        .await
        .context("Failed to list playlists")?;
    let selected = select_playlists(all, &ctx.settings.playlist_filter);
    tracing::info!(count = selected.len(), "Fetching playlists");

    let processor = ctx.processor();
    let keep: Vec<i64> = selected.iter().map(|p| p.id).collect();
    let db = ctx.db.clone();
    processor.post(move || async move {
        let removed = db.prune_playlists(&keep).await?;
        if removed > 0 {
            tracing::info!(removed, "Forgot playlists no longer synced");
        }
        Ok(())
    });

    for playlist in selected {
        let catalog = ctx.catalog.clone();
        let db = ctx.db.clone();
        let handle = processor.clone();
        processor.add(move || async move {
            let songs = catalog
                .playlist_songs(playlist.id)
                .await
                .with_context(|| format!("Failed to fetch playlist {}", playlist.name))?;
            tracing::debug!(playlist = %playlist.name, songs = songs.len(), "Fetched playlist");
            handle.post(move || async move {
                db.replace_playlist(&playlist, &songs)
                    .await
                    .with_context(|| format!("Failed to store playlist {}", playlist.name))
            });
            Ok(())
        });
    }

    drive(ctx, "fetch-playlists", &processor).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{song, FakeCatalog, TestEnv};
    use crate::state::StateDb;

    fn playlist(id: i64, name: &str) -> Playlist {
        Playlist {
            id,
            name: name.into(),
            song_count: 1,
        }
    }

    #[test]
    fn test_select_playlists() {
        let all = vec![playlist(1, "A"), playlist(2, "B"), playlist(3, "C")];
        assert_eq!(select_playlists(all.clone(), &[]).len(), 3);
        let picked = select_playlists(all, &["C".into(), "A".into(), "missing".into()]);
        let ids: Vec<_> = picked.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_one_bad_playlist_does_not_block_others() {
        let mut catalog = FakeCatalog::default();
        catalog.add_playlist(playlist(1, "Good"), vec![song(10, "a", 1)]);
        // Listed but its songs cannot be fetched.
        catalog.playlists.push(playlist(2, "Broken"));
        let env = TestEnv::new(catalog);

        let summary = fetch_playlists(&env.ctx).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        // Prune plus the one stored playlist.
        assert_eq!(summary.effects_succeeded, 2);

        let stored = env.db.get_playlists().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Good");
    }

    #[tokio::test]
    async fn test_unselected_playlists_are_pruned() {
        let mut catalog = FakeCatalog::default();
        catalog.add_playlist(playlist(1, "Keep"), vec![song(10, "a", 1)]);
        catalog.add_playlist(playlist(2, "Drop"), vec![song(11, "b", 1)]);
        let mut env = TestEnv::new(catalog);
        fetch_playlists(&env.ctx).await.unwrap();
        assert_eq!(env.db.get_playlists().await.unwrap().len(), 2);

        env.settings_mut().playlist_filter = vec!["Keep".into()];
        fetch_playlists(&env.ctx).await.unwrap();
        let stored = env.db.get_playlists().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, 1);
    }
}
