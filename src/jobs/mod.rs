//! Pipeline steps and the runner the scheduler drives.
//!
//! Every step is a thin layer over [`Processor`]: remote and disk work fans
//! out as units, and every write to the store is posted as an effect so the
//! store only ever sees one writer.

mod albums;
mod artwork;
mod audio;
mod m3u;
mod optimize;
mod playlists;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

pub use optimize::{AlbumSource, NormalizeConfig};

use crate::catalog::Catalog;
use crate::processor::{Processor, ProcessorEvent, ProcessorSummary};
use crate::progress::TransferProgress;
use crate::scheduler::presence::Device;
use crate::scheduler::Pipeline;
use crate::state::{StateDb, SyncRunStats};
use crate::tags::TagCodec;
use crate::types::Bitrate;

/// Settings shared by every step.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub uin: String,
    pub variant: Bitrate,
    pub audio_dir: PathBuf,
    pub artwork_dir: PathBuf,
    pub playlists_dir: PathBuf,
    /// Playlist names to sync; empty means every playlist.
    pub playlist_filter: Vec<String>,
    pub concurrency: usize,
    pub album_tags: AlbumSource,
}

impl JobSettings {
    pub fn normalize(&self) -> NormalizeConfig {
        NormalizeConfig {
            variant: self.variant,
            album: self.album_tags.clone(),
        }
    }
}

/// Collaborators handed to every step.
#[derive(Clone)]
pub struct JobContext {
    pub settings: Arc<JobSettings>,
    pub catalog: Arc<dyn Catalog>,
    pub db: Arc<dyn StateDb>,
    pub codec: Arc<dyn TagCodec>,
    pub progress: Arc<dyn TransferProgress>,
}

impl JobContext {
    fn processor(&self) -> Processor {
        Processor::new(self.settings.concurrency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchPlaylists,
    FetchAlbums,
    FetchAudio,
    FetchArtwork,
    OptimizeTags,
    BuildPlaylistFiles,
}

impl Step {
    /// Later steps rely on what earlier ones stored.
    pub const PERIODIC: [Step; 6] = [
        Step::FetchPlaylists,
        Step::FetchAlbums,
        Step::FetchAudio,
        Step::FetchArtwork,
        Step::OptimizeTags,
        Step::BuildPlaylistFiles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::FetchPlaylists => "fetch-playlists",
            Step::FetchAlbums => "fetch-albums",
            Step::FetchAudio => "fetch-audio",
            Step::FetchArtwork => "fetch-artwork",
            Step::OptimizeTags => "optimize-tags",
            Step::BuildPlaylistFiles => "build-playlist-files",
        }
    }

    pub async fn run(self, ctx: &JobContext) -> anyhow::Result<ProcessorSummary> {
        match self {
            Step::FetchPlaylists => playlists::fetch_playlists(ctx).await,
            Step::FetchAlbums => albums::fetch_albums(ctx).await,
            Step::FetchAudio => audio::fetch_audio(ctx).await,
            Step::FetchArtwork => artwork::fetch_artwork(ctx).await,
            Step::OptimizeTags => optimize::optimize_tags(ctx).await,
            Step::BuildPlaylistFiles => m3u::build_playlist_files(ctx).await,
        }
    }
}

/// Run a processor to completion, logging each unit and effect failure
/// under the step's name.
pub(crate) async fn drive(
    ctx: &JobContext,
    step: &'static str,
    processor: &Processor,
) -> anyhow::Result<ProcessorSummary> {
    let mut events = processor.subscribe();
    let progress = ctx.progress.clone();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProcessorEvent::Error { message }) => {
                    progress.suspend(&mut || tracing::warn!(step, "{message}"));
                }
                Ok(ProcessorEvent::EffectError { message }) => {
                    progress.suspend(&mut || {
                        tracing::warn!(step, "Failed to record result: {message}")
                    });
                }
                Ok(ProcessorEvent::Finish(_)) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(step, skipped, "Dropped failure reports");
                }
            }
        }
    });
    let summary = processor.run().await?;
    if let Err(e) = logger.await {
        tracing::debug!(error = %e, "Failure logger task ended abnormally");
    }
    Ok(summary)
}

/// Run `steps` in order and record the tick in the store. A failing step is
/// logged and the next one still runs; cancellation stops before the next
/// step starts.
pub async fn run_steps(
    ctx: &JobContext,
    steps: &[Step],
    cancel: &CancellationToken,
) -> SyncRunStats {
    let started = Instant::now();
    let run_id = match ctx.db.start_sync_run().await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to record sync run start");
            None
        }
    };

    let settings = &ctx.settings;
    for dir in [&settings.audio_dir, &settings.artwork_dir, &settings.playlists_dir] {
        match crate::fetch::sweep_stale_temps(dir).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(dir = %dir.display(), removed, "Removed stale staging files")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to sweep staging files"),
        }
    }

    let mut stats = SyncRunStats::default();
    for step in steps {
        if cancel.is_cancelled() {
            tracing::info!("Shutdown requested, skipping remaining steps");
            stats.interrupted = true;
            break;
        }
        let step_started = Instant::now();
        match step.run(ctx).await {
            Ok(summary) => {
                tracing::info!(
                    step = step.name(),
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    effects_failed = summary.effects_failed,
                    elapsed = %format_duration(step_started.elapsed()),
                    "Step finished"
                );
                stats.record_step(true, summary.succeeded, summary.failed);
            }
            Err(e) => {
                tracing::error!(step = step.name(), error = %format!("{e:#}"), "Step failed");
                stats.record_step(false, 0, 0);
            }
        }
    }

    if let Some(id) = run_id {
        if let Err(e) = ctx.db.complete_sync_run(id, &stats).await {
            tracing::warn!(error = %e, "Failed to record sync run completion");
        }
    }

    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} steps ok, {} failed; {} units ok, {} failed",
        stats.steps_succeeded,
        stats.steps_failed,
        stats.units_succeeded,
        stats.units_failed
    );
    tracing::info!("  elapsed: {}", format_duration(started.elapsed()));
    stats
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Connects the scheduler to the steps.
pub struct JobRunner {
    ctx: JobContext,
    steps: Vec<Step>,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx,
            steps: Step::PERIODIC.to_vec(),
        }
    }
}

#[async_trait]
impl Pipeline for JobRunner {
    async fn run_periodic(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let stats = run_steps(&self.ctx, &self.steps, cancel).await;
        if stats.steps_succeeded == 0 && stats.steps_failed > 0 {
            anyhow::bail!("every step failed");
        }
        Ok(())
    }

    async fn run_device_sync(
        &self,
        device: &Device,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let summary = transfer::sync_device(&self.ctx, device, cancel)
            .await
            .with_context(|| format!("Failed to sync {}", device.name))?;
        summary.log(&device.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{song, FakeCatalog, TestEnv};
    use super::*;
    use crate::catalog::Playlist;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(61)), "1m 01s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
    }

    #[test]
    fn test_periodic_order() {
        let names: Vec<_> = Step::PERIODIC.iter().map(Step::name).collect();
        assert_eq!(
            names,
            [
                "fetch-playlists",
                "fetch-albums",
                "fetch-audio",
                "fetch-artwork",
                "optimize-tags",
                "build-playlist-files",
            ]
        );
    }

    #[tokio::test]
    async fn test_full_tick_end_to_end() {
        let mut catalog = FakeCatalog::default();
        catalog.add_playlist(
            Playlist {
                id: 1,
                name: "Road".into(),
                song_count: 2,
            },
            vec![song(10, "s10", 100), song(11, "s11", 100)],
        );
        let env = TestEnv::new(catalog);

        let stats = run_steps(&env.ctx, &Step::PERIODIC, &CancellationToken::new()).await;
        assert_eq!(stats.steps_failed, 0);
        assert_eq!(stats.steps_succeeded, 6);
        assert!(!stats.interrupted);

        let audios = env.db.get_audios(Bitrate::Mp3_320).await.unwrap();
        assert_eq!(audios.len(), 2);
        let m3u = std::fs::read_to_string(env.ctx.settings.playlists_dir.join("Road.m3u")).unwrap();
        assert!(m3u.starts_with("#EXTM3U\n"));
        assert_eq!(m3u.matches("#EXTINF").count(), 2);

        let summary = env.db.get_summary().await.unwrap();
        assert_eq!(summary.playlists, 1);
        assert!(summary.last_sync_completed.is_some());

        // Nothing left to download on the next tick.
        let before = env.catalog.audio_calls.load(Ordering::SeqCst);
        run_steps(&env.ctx, &Step::PERIODIC, &CancellationToken::new()).await;
        assert_eq!(env.catalog.audio_calls.load(Ordering::SeqCst), before);
        assert_eq!(env.codec.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_step_does_not_stop_the_tick() {
        let catalog = FakeCatalog {
            fail_listing: true,
            ..Default::default()
        };
        let env = TestEnv::new(catalog);
        let stats = run_steps(&env.ctx, &Step::PERIODIC, &CancellationToken::new()).await;
        // Only the playlist listing fails; album listing fails inside its unit.
        assert_eq!(stats.steps_failed, 1);
        assert_eq!(stats.steps_succeeded, 5);
        assert_eq!(stats.units_failed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() {
        let env = TestEnv::new(FakeCatalog::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = run_steps(&env.ctx, &Step::PERIODIC, &cancel).await;
        assert!(stats.interrupted);
        assert_eq!(stats.steps_succeeded + stats.steps_failed, 0);
    }
}
