use anyhow::Context;

use super::{drive, JobContext};
use crate::fetch::paths::artwork_file_name;
use crate::fetch::{fetch_to_file, FetchError, FetchTarget, Transform};
use crate::processor::ProcessorSummary;

/// Artwork is stored this many pixels wide.
pub const ARTWORK_WIDTH: u32 = 500;

pub(super) async fn fetch_artwork(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let albums = ctx
        .db
        .albums_missing_artwork()
        .await
        .context("Failed to list albums without artwork")?;
    tracing::info!(count = albums.len(), "Fetching artwork");

    let processor = ctx.processor();
    for album in albums {
        let file = artwork_file_name(&album.mid, album.id);
        let target = FetchTarget::new(file.clone(), ctx.settings.artwork_dir.join(file));
        let catalog = ctx.catalog.clone();
        let db = ctx.db.clone();
        let progress = ctx.progress.clone();
        let handle = processor.clone();
        processor.add(move || async move {
            let on_disk = tokio::fs::try_exists(&target.final_path)
                .await
                .unwrap_or(false);
            if !on_disk {
                let remote = catalog.artwork_stream(album.id).await.map_err(|source| {
                    FetchError::Remote {
                        key: target.key.clone(),
                        source,
                    }
                })?;
                fetch_to_file(
                    remote,
                    &target,
                    Transform::Jpeg {
                        width: ARTWORK_WIDTH,
                    },
                    progress.as_ref(),
                )
                .await?;
            }
            handle.post(move || async move {
                db.set_album_artwork(album.id, &target.final_path)
                    .await
                    .with_context(|| format!("Failed to link artwork of {}", album.name))
            });
            Ok(())
        });
    }
    drive(ctx, "fetch-artwork", &processor).await
}
