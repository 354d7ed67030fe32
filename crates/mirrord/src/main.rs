use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_core::detector::DetectorSettings;
use mirror_core::{CooldownGate, MirrorConfig, ScrfdDetector};
use mirror_hw::{AudioOutput, Camera, CaptureFormat, PlaybackQueue};
use tracing_subscriber::EnvFilter;

mod engine;
mod worker;

use engine::{spawn_capture_loop, CaptureLoop, CaptureOptions};
use worker::{ComplimentPipeline, WorkerPool};

/// How long shutdown waits for running jobs before giving up on them.
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("mirrord starting");

    let config = MirrorConfig::load().context("failed to load configuration")?;

    // Hardware and model first: any of these failing is fatal
    let camera = Camera::open(
        &config.camera.device,
        CaptureFormat {
            width: config.camera.width,
            height: config.camera.height,
            fps: config.camera.fps,
        },
    )
    .with_context(|| format!("failed to open camera {}", config.camera.device))?;
    tracing::info!(
        device = %config.camera.device,
        width = camera.width,
        height = camera.height,
        format = ?camera.pixel_format(),
        "camera ready"
    );

    let detector = ScrfdDetector::load(
        &config.detection.model_path,
        DetectorSettings::from(&config.detection),
    )
    .with_context(|| {
        format!(
            "failed to load detector model {}",
            config.detection.model_path.display()
        )
    })?;
    tracing::info!(path = %config.detection.model_path.display(), "SCRFD detector loaded");

    let speaker = AudioOutput::open().context("failed to open audio output")?;
    let playback = Arc::new(PlaybackQueue::new(speaker, config.audio.idle_poll()));

    let pipeline = Arc::new(
        ComplimentPipeline::from_config(&config, Arc::clone(&playback))
            .context("failed to build service clients")?,
    );
    let pool = WorkerPool::spawn(pipeline, &config.workers);

    let gate = Arc::new(CooldownGate::new(config.detection.cooldown()));
    tracing::info!(
        cooldown_secs = gate.window().as_secs(),
        poll_ms = config.detection.poll_interval_ms,
        "cooldown gate armed"
    );
    let capture = spawn_capture_loop(CaptureLoop::new(
        camera,
        detector,
        gate,
        pool.sender(),
        CaptureOptions::from(&config),
    ))
    .context("failed to start camera capture")?;

    tracing::info!("mirrord ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("mirrord shutting down");

    // Joining the capture thread drops the camera and the last job sender
    tokio::task::spawn_blocking(move || capture.stop()).await?;
    if tokio::time::timeout(JOB_DRAIN_TIMEOUT, pool.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("jobs still running at shutdown, abandoning them");
    }

    tokio::task::spawn_blocking(move || playback.stop()).await?;

    tracing::info!("mirrord stopped");
    Ok(())
}
