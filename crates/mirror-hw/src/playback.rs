//! FIFO playback queue feeding a single playback thread.
//!
//! The network side pushes chunks as they arrive; one lazily started thread
//! plays them strictly in arrival order, one at a time. When the queue runs
//! dry the thread naps for `idle_poll` and looks again, so a slow stream does
//! not tear the thread down between chunks. Only [`PlaybackQueue::stop`] (or
//! dropping the queue) ends it, after the remaining chunks have played.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::{AudioError, AudioOutput};

/// One piece of encoded audio as received from the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Position in the queue's arrival order, starting at 0.
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// Renders chunks. Called from the playback thread only.
pub trait AudioSink: Send {
    /// Play one chunk to completion.
    fn play(&mut self, chunk: &AudioChunk) -> Result<(), AudioError>;
}

impl AudioSink for AudioOutput {
    fn play(&mut self, chunk: &AudioChunk) -> Result<(), AudioError> {
        self.play_mp3(&chunk.bytes)
    }
}

struct Shared {
    queue: Mutex<VecDeque<AudioChunk>>,
    sink: Mutex<Box<dyn AudioSink>>,
    running: AtomicBool,
    /// Chunks queued or currently playing.
    pending: AtomicUsize,
    next_seq: AtomicU64,
    idle_poll: Duration,
}

/// Lifecycle of the playback thread. Guarded by one lock so a push can never
/// start a second thread while `stop` is still joining the first.
enum Worker {
    Idle,
    Running(JoinHandle<()>),
    Stopping,
}

pub struct PlaybackQueue {
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
}

impl PlaybackQueue {
    pub fn new(sink: impl AudioSink + 'static, idle_poll: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                sink: Mutex::new(Box::new(sink)),
                running: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                next_seq: AtomicU64::new(0),
                idle_poll,
            }),
            worker: Mutex::new(Worker::Idle),
        }
    }

    /// Append a chunk, starting the playback thread if it is idle.
    ///
    /// Returns `None` and drops the chunk while [`stop`](Self::stop) is in
    /// progress.
    pub fn push(&self, bytes: Vec<u8>) -> Option<u64> {
        let mut worker = lock(&self.worker);
        if matches!(*worker, Worker::Stopping) {
            tracing::warn!(bytes = bytes.len(), "playback stopping, audio chunk dropped");
            return None;
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.queue).push_back(AudioChunk { seq, bytes });
        self.shared.pending.fetch_add(1, Ordering::AcqRel);

        let alive = matches!(&*worker, Worker::Running(handle) if !handle.is_finished());
        if !alive {
            self.start_locked(&mut worker);
        }
        Some(seq)
    }

    /// Chunks not yet fully played.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        matches!(&*lock(&self.worker), Worker::Running(handle) if !handle.is_finished())
    }

    /// Block until every pushed chunk has played or `timeout` passes.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.shared.idle_poll.max(Duration::from_millis(1)));
        }
        true
    }

    /// Let queued chunks finish, then end the playback thread.
    ///
    /// Pushes made while this runs are dropped; later pushes start a fresh
    /// thread.
    pub fn stop(&self) {
        let handle = {
            let mut worker = lock(&self.worker);
            match std::mem::replace(&mut *worker, Worker::Stopping) {
                Worker::Running(handle) => {
                    self.shared.running.store(false, Ordering::Release);
                    handle
                }
                Worker::Idle => {
                    *worker = Worker::Idle;
                    return;
                }
                // Another caller is already joining
                Worker::Stopping => return,
            }
        };

        if handle.join().is_err() {
            tracing::error!("playback thread panicked");
        }
        *lock(&self.worker) = Worker::Idle;
        tracing::debug!("playback thread stopped");
    }

    fn start_locked(&self, worker: &mut Worker) {
        if let Worker::Running(old) = std::mem::replace(worker, Worker::Idle) {
            // Only a panicked thread finishes without stop
            if old.join().is_err() {
                tracing::error!("playback thread panicked, restarting");
            }
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        match std::thread::Builder::new()
            .name("mirror-playback".into())
            .spawn(move || playback_loop(&shared))
        {
            Ok(handle) => *worker = Worker::Running(handle),
            Err(e) => tracing::error!(error = %e, "failed to spawn playback thread"),
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn playback_loop(shared: &Shared) {
    tracing::debug!("playback thread started");
    loop {
        let next = lock(&shared.queue).pop_front();
        match next {
            Some(chunk) => {
                let started = Instant::now();
                if let Err(e) = lock(&shared.sink).play(&chunk) {
                    tracing::warn!(seq = chunk.seq, error = %e, "failed to play audio chunk");
                } else {
                    tracing::trace!(
                        seq = chunk.seq,
                        bytes = chunk.bytes.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "chunk played"
                    );
                }
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            None if shared.running.load(Ordering::Acquire) => {
                std::thread::sleep(shared.idle_poll);
            }
            None => break,
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
