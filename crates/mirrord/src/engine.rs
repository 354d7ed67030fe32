//! Capture/detect loop on a dedicated OS thread.
//!
//! The thread owns the frame source and the detector. Every poll period it
//! grabs a frame, checks for a person, and if the cooldown gate opens hands a
//! [`ComplimentJob`] to the worker pool without ever blocking on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mirror_core::config::MirrorConfig;
use mirror_core::{CooldownGate, HumanDetector};
use mirror_hw::{CameraError, Frame, FrameSource};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::worker::ComplimentJob;

/// Share of near-black pixels above which a frame is skipped.
const DARK_THRESHOLD: f32 = 0.95;

/// Per-frame knobs taken from the camera and detection config.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub hflip: bool,
    pub vflip: bool,
    pub skip_dark_frames: bool,
    pub warmup_frames: usize,
    pub poll_interval: Duration,
}

impl From<&MirrorConfig> for CaptureOptions {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            hflip: config.camera.hflip,
            vflip: config.camera.vflip,
            skip_dark_frames: config.detection.skip_dark_frames,
            warmup_frames: config.camera.warmup_frames,
            poll_interval: config.detection.poll_interval(),
        }
    }
}

/// One oriented frame and whether a person is in it.
pub struct DetectionEvent {
    pub frame: Frame,
    pub human_present: bool,
}

/// What a single loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    CaptureFailed,
    Dark,
    NoHuman,
    CoolingDown { remaining: Duration },
    Dispatched(Uuid),
    /// The job queue was full; the cooldown was left open.
    Saturated,
    /// The worker pool is gone.
    Closed,
}

pub struct CaptureLoop<S, D> {
    source: S,
    detector: D,
    gate: Arc<CooldownGate>,
    jobs: mpsc::Sender<ComplimentJob>,
    options: CaptureOptions,
}

impl<S: FrameSource, D: HumanDetector> CaptureLoop<S, D> {
    pub fn new(
        source: S,
        detector: D,
        gate: Arc<CooldownGate>,
        jobs: mpsc::Sender<ComplimentJob>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            source,
            detector,
            gate,
            jobs,
            options,
        }
    }

    /// Capture and orient a frame, then run the detector on it.
    ///
    /// Returns `Ok(None)` for a dark frame that was skipped. Detector errors
    /// count as nobody being there.
    pub fn observe(&mut self) -> Result<Option<DetectionEvent>, CameraError> {
        let mut frame = self.source.capture_frame()?;
        frame.flip(self.options.hflip, self.options.vflip);

        if self.options.skip_dark_frames && frame.is_dark(DARK_THRESHOLD) {
            return Ok(None);
        }

        let human_present = match self
            .detector
            .human_present(&frame.data, frame.width, frame.height)
        {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed");
                false
            }
        };
        Ok(Some(DetectionEvent {
            frame,
            human_present,
        }))
    }

    /// Run one iteration as of `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let event = match self.observe() {
            Ok(Some(event)) => event,
            Ok(None) => return TickOutcome::Dark,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return TickOutcome::CaptureFailed;
            }
        };
        if !event.human_present {
            return TickOutcome::NoHuman;
        }

        let Some(ticket) = self.gate.try_acquire(now) else {
            return TickOutcome::CoolingDown {
                remaining: self.gate.remaining(now),
            };
        };

        let job = ComplimentJob::new(event.frame, ticket.acquired_at());
        let id = job.id;
        match self.jobs.try_send(job) {
            Ok(()) => TickOutcome::Dispatched(id),
            Err(TrySendError::Full(_)) => {
                self.gate.revert(ticket);
                TickOutcome::Saturated
            }
            Err(TrySendError::Closed(_)) => {
                self.gate.revert(ticket);
                TickOutcome::Closed
            }
        }
    }

    /// Start the source and drop warm-up frames while exposure settles.
    pub fn start(&mut self) -> Result<(), CameraError> {
        self.source.start()?;
        if self.options.warmup_frames > 0 {
            tracing::info!(count = self.options.warmup_frames, "discarding warmup frames");
            for _ in 0..self.options.warmup_frames {
                if let Err(e) = self.source.capture_frame() {
                    tracing::debug!(error = %e, "warmup capture failed");
                }
            }
        }
        Ok(())
    }

    /// Tick until `stop` is set or the job queue closes.
    pub fn run(&mut self, stop: &AtomicBool) {
        tracing::info!("watching for people");
        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            match self.tick(started) {
                TickOutcome::Dispatched(id) => tracing::info!(job = %id, "person detected, job queued"),
                TickOutcome::CoolingDown { remaining } => {
                    tracing::trace!(remaining_ms = remaining.as_millis() as u64, "cooling down")
                }
                TickOutcome::Saturated => tracing::debug!("job queue full, detection dropped"),
                TickOutcome::Closed => {
                    tracing::warn!("job queue closed");
                    break;
                }
                TickOutcome::CaptureFailed | TickOutcome::Dark | TickOutcome::NoHuman => {}
            }
            if let Some(rest) = self.options.poll_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }
}

/// Handle to a running capture thread.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signal the loop and wait for the thread, which drops the source.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("capture thread panicked");
            }
            tracing::info!("capture thread stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("failed to start frame source: {0}")]
    Start(#[from] CameraError),
    #[error("capture thread exited during startup")]
    Exited,
}

/// Spawn the capture loop on its own OS thread.
///
/// Returns once the source has started and warmed up, so a camera that
/// cannot stream fails here instead of inside the thread.
pub fn spawn_capture_loop<S, D>(mut capture: CaptureLoop<S, D>) -> Result<CaptureHandle, SpawnError>
where
    S: FrameSource + Send + 'static,
    D: HumanDetector + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("mirror-capture".into())
        .spawn(move || {
            tracing::info!("capture thread started");
            let started = capture.start();
            let ok = started.is_ok();
            if ready_tx.send(started).is_err() || !ok {
                tracing::info!("capture thread exiting before start");
                return;
            }
            capture.run(&flag);
            tracing::info!("capture thread exiting");
        })?;
    let handle = CaptureHandle {
        stop,
        thread: Some(thread),
    };

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(SpawnError::Start(e)),
        Err(_) => Err(SpawnError::Exited),
    }
}
