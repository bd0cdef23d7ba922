use anyhow::Context;

use super::{drive, JobContext};
use crate::processor::ProcessorSummary;

pub(super) async fn fetch_albums(ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
    let processor = ctx.processor();
    let catalog = ctx.catalog.clone();
    let db = ctx.db.clone();
    let uin = ctx.settings.uin.clone();
    let handle = processor.clone();
    processor.add(move || async move {
        let albums = catalog
            .albums(&uin)
            .await
            .context("Failed to list followed albums")?;
        tracing::debug!(count = albums.len(), "Fetched followed albums");
        handle.post(move || async move {
            db.follow_albums(&albums)
                .await
                .context("Failed to store followed albums")
        });
        Ok(())
    });
    drive(ctx, "fetch-albums", &processor).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Album, Artist};
    use crate::jobs::testing::{FakeCatalog, TestEnv};
    use crate::state::StateDb;

    #[tokio::test]
    async fn test_followed_albums_are_recorded() {
        let catalog = FakeCatalog {
            albums: vec![Album {
                id: 7,
                mid: "alb7".into(),
                name: "Seven".into(),
                artist: Some(Artist {
                    id: 3,
                    mid: "art3".into(),
                    name: "Three".into(),
                }),
            }],
            ..Default::default()
        };
        let env = TestEnv::new(catalog);
        let summary = fetch_albums(&env.ctx).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.effects_succeeded, 1);
        assert_eq!(env.db.get_summary().await.unwrap().followed_albums, 1);
    }

    #[tokio::test]
    async fn test_listing_failure_counts_as_failed_unit() {
        let catalog = FakeCatalog {
            fail_listing: true,
            ..Default::default()
        };
        let env = TestEnv::new(catalog);
        let summary = fetch_albums(&env.ctx).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.effects_succeeded, 0);
    }
}
