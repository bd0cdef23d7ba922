//! walkman-go: mirror music-service playlists into a local library and copy
//! them onto a portable player whenever it is plugged in.
//!
//! A periodic pipeline fetches playlists, albums, audio and artwork, then
//! normalizes tags and writes M3U files. When a volume matching the
//! configured device name appears, the scheduler pauses the pipeline and
//! syncs the library onto it instead.

#![warn(clippy::all)]

mod catalog;
mod cli;
mod config;
mod fetch;
mod jobs;
mod processor;
mod progress;
mod scheduler;
mod shutdown;
mod state;
mod tags;
mod types;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use jobs::{JobContext, JobRunner, Step};
use scheduler::presence::{DeviceFilter, MountPoller};
use scheduler::Scheduler;
use state::StateDb;

/// Print what the local store holds.
async fn run_status(config: &Config) -> anyhow::Result<()> {
    let db_path = config.db_path();

    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let db = state::SqliteStateDb::open(&db_path).await?;
    let summary = db.get_summary().await?;

    println!("State Database: {}", db_path.display());
    println!();
    println!("Library:");
    println!("  Playlists:       {}", summary.playlists);
    println!("  Songs:           {}", summary.songs);
    println!("  Followed albums: {}", summary.followed_albums);
    println!("  Audio files:     {}", summary.audio_files);
    println!("  Artworks:        {}", summary.artworks);
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

/// Open the store and assemble the collaborators every step shares.
async fn build_context(config: &Config) -> anyhow::Result<JobContext> {
    let settings = config.job_settings()?;

    tokio::fs::create_dir_all(&config.workdir)
        .await
        .with_context(|| format!("Failed to create {}", config.workdir.display()))?;
    let db_path = config.db_path();
    let db = state::SqliteStateDb::open(&db_path)
        .await
        .with_context(|| format!("Failed to open state database at {}", db_path.display()))?;
    let catalog = catalog::qqmusic::QqMusicClient::new()?;

    Ok(JobContext {
        settings: Arc::new(settings),
        catalog: Arc::new(catalog),
        db: Arc::new(db),
        codec: Arc::new(tags::LoftyCodec),
        progress: Arc::from(progress::BarProgress::boxed(config.no_progress_bar)),
    })
}

async fn run_once(config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    let stats = jobs::run_steps(&ctx, &Step::PERIODIC, cancel).await;
    if stats.steps_failed > 0 {
        anyhow::bail!("{} of {} steps failed", stats.steps_failed, Step::PERIODIC.len());
    }
    Ok(())
}

async fn run_scheduler(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let ctx = build_context(config).await?;
    let pipeline = Arc::new(JobRunner::new(ctx));
    let source = Arc::new(MountPoller::new(
        config.media_root.clone(),
        config.poll_interval,
    ));
    let scheduler = Scheduler::new(
        pipeline,
        source,
        DeviceFilter::new(config.device_name.clone()),
        config.interval,
    );

    let mut transitions = scheduler.transitions();
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(status) => tracing::debug!(
                    mode = ?status.mode,
                    timer_running = status.timer_running,
                    device = ?status.device,
                    device_syncs = status.device_syncs,
                    "Scheduler status"
                ),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Scheduler status log fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(device) = config.override_device() {
        return scheduler.run_override(device, &cancel).await;
    }

    tracing::info!(
        media_root = %config.media_root.display(),
        device = %config.device_name,
        interval_secs = config.interval.as_secs(),
        "Watching for device"
    );
    scheduler.run(cancel).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;

    match cli.effective_command() {
        Command::Status => run_status(&config).await,
        Command::Once => {
            tracing::info!(concurrency = config.threads_num, "Starting walkman-go run");
            let cancel = shutdown::install_signal_handler()?;
            run_once(&config, &cancel).await
        }
        Command::Run => {
            tracing::info!(concurrency = config.threads_num, "Starting walkman-go");
            let cancel = shutdown::install_signal_handler()?;
            run_scheduler(&config, cancel).await
        }
    }
}
