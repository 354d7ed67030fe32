//! Compliment jobs and the bounded pool that runs them.
//!
//! The capture thread hands a [`ComplimentJob`] to the pool's channel with
//! `try_send`; the dispatcher task admits at most `workers` jobs at a time and
//! leaves the rest waiting in the channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use mirror_core::config::{MirrorConfig, WorkerSettings};
use mirror_core::prompt::{format_timestamp, PromptContext};
use mirror_core::Compliment;
use mirror_hw::{Frame, FrameError, PlaybackQueue};
use mirror_net::tts::SpeechOutcome;
use mirror_net::{EmotionClient, LocationClient, NetError, TtsClient, VisionClient, WeatherClient};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] FrameError),
    #[error("encoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A detection that made it through the cooldown gate.
pub struct ComplimentJob {
    pub id: Uuid,
    pub frame: Frame,
    /// Wall-clock capture time, used for the prompt.
    pub captured_at: DateTime<Local>,
    /// Start of the cooldown window this job consumed.
    pub cooldown_at: Instant,
}

impl ComplimentJob {
    pub fn new(frame: Frame, cooldown_at: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            frame,
            captured_at: Local::now(),
            cooldown_at,
        }
    }
}

/// How a job ended.
#[derive(Debug)]
pub struct JobReport {
    pub id: Uuid,
    pub compliment: Compliment,
    pub audio: Result<SpeechOutcome, NetError>,
}

/// Runs one job to completion.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: ComplimentJob) -> impl Future<Output = Result<JobReport, JobError>> + Send;
}

/// Frame in, spoken compliment out.
pub struct ComplimentPipeline {
    location: LocationClient,
    weather: WeatherClient,
    emotion: EmotionClient,
    vision: VisionClient,
    tts: TtsClient,
    template: String,
    playback: Arc<PlaybackQueue>,
}

impl ComplimentPipeline {
    pub fn from_config(config: &MirrorConfig, playback: Arc<PlaybackQueue>) -> Result<Self, NetError> {
        Ok(Self {
            location: LocationClient::new(&config.location)?,
            weather: WeatherClient::new(&config.weather)?,
            emotion: EmotionClient::new(&config.emotion)?,
            vision: VisionClient::new(&config.vision)?,
            tts: TtsClient::new(&config.tts)?,
            template: config.vision.template().to_string(),
            playback,
        })
    }

    /// Encode, gather context, ask for a compliment, then speak it.
    ///
    /// Only a failed JPEG encode is an error. Everything after that degrades
    /// instead: missing context is tagged in the prompt, a failed vision call
    /// yields a fallback compliment, and a failed TTS stream is recorded in
    /// the report.
    pub async fn process(&self, job: ComplimentJob) -> Result<JobReport, JobError> {
        let started = Instant::now();
        let ComplimentJob {
            id,
            frame,
            captured_at,
            cooldown_at,
        } = job;
        tracing::info!(
            queued_ms = started.saturating_duration_since(cooldown_at).as_millis() as u64,
            "job started"
        );

        let quality = self.vision.settings().jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality)).await??;
        tracing::debug!(bytes = jpeg.len(), "frame encoded");

        let time = format_timestamp(&captured_at);
        let ((location, weather), emotion) = tokio::join!(
            async {
                let location = self.location.locate_or_none().await;
                let weather = self.weather.report_for(location.as_ref()).await;
                (location, weather)
            },
            self.emotion.reading(&jpeg),
        );
        let context = PromptContext {
            weather,
            location,
            time,
            emotion,
        };
        let prompt = context.render(&self.template);
        tracing::debug!(prompt = %prompt, "prompt rendered");

        let compliment = self.vision.compliment_or_fallback(&prompt, &jpeg).await;

        let playback = &self.playback;
        let audio = self
            .tts
            .speak(compliment.text(), |chunk| {
                playback.push(chunk);
            })
            .await;
        if let Err(e) = &audio {
            tracing::error!(error = %e, "speech synthesis failed");
        }

        tracing::info!(
            degraded = compliment.is_degraded(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        Ok(JobReport {
            id,
            compliment,
            audio,
        })
    }
}

impl JobRunner for ComplimentPipeline {
    fn run(&self, job: ComplimentJob) -> impl Future<Output = Result<JobReport, JobError>> + Send {
        let span = tracing::info_span!("job", id = %job.id);
        self.process(job).instrument(span)
    }
}

/// Bounded worker pool fed by a bounded channel.
pub struct WorkerPool {
    tx: mpsc::Sender<ComplimentJob>,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn spawn<R: JobRunner>(runner: Arc<R>, settings: &WorkerSettings) -> Self {
        let workers = settings.count.max(1);
        let (tx, rx) = mpsc::channel(settings.queue.max(1));
        tracing::info!(workers, queue = settings.queue.max(1), "worker pool started");
        let dispatcher = tokio::spawn(dispatch(runner, rx, workers));
        Self { tx, dispatcher }
    }

    /// Producer side of the job queue.
    pub fn sender(&self) -> mpsc::Sender<ComplimentJob> {
        self.tx.clone()
    }

    /// Wait for queued and running jobs to finish.
    ///
    /// Returns once every other sender has been dropped too.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "job dispatcher failed");
        }
        tracing::info!("worker pool stopped");
    }
}

async fn dispatch<R: JobRunner>(runner: Arc<R>, mut rx: mpsc::Receiver<ComplimentJob>, workers: usize) {
    let permits = Arc::new(Semaphore::new(workers));
    loop {
        // Hold a free worker before taking a job so waiting jobs stay queued
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(job) = rx.recv().await else {
            break;
        };
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            let id = job.id;
            match runner.run(job).await {
                Ok(report) => log_report(&report),
                Err(e) => tracing::error!(job = %id, error = %e, "job aborted"),
            }
            drop(permit);
        });
    }

    if !wait_idle(&permits, workers).await {
        tracing::warn!("worker permits closed before running jobs finished");
    }
}

/// Wait until all `workers` permits are free again. False if the semaphore
/// was closed instead.
async fn wait_idle(permits: &Semaphore, workers: usize) -> bool {
    let in_flight = u32::try_from(workers).unwrap_or(u32::MAX);
    match permits.acquire_many(in_flight).await {
        Ok(_all) => true,
        Err(e) => {
            tracing::debug!(error = %e, "permit wait ended");
            false
        }
    }
}

fn log_report(report: &JobReport) {
    match &report.audio {
        Ok(audio) => tracing::info!(
            job = %report.id,
            degraded = report.compliment.is_degraded(),
            chunks = audio.chunks,
            completed = audio.completed,
            "compliment delivered"
        ),
        Err(e) => tracing::warn!(
            job = %report.id,
            degraded = report.compliment.is_degraded(),
            error = %e,
            "compliment not spoken"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::Engine as _;
    use mirror_core::prompt::FALLBACK_COMPLIMENTS;
    use mirror_hw::{AudioChunk, AudioError, AudioSink};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl AudioSink for Recorder {
        fn play(&mut self, chunk: &AudioChunk) -> Result<(), AudioError> {
            self.0.lock().unwrap().push(chunk.bytes.clone());
            Ok(())
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(vec![150; 32 * 24 * 3], 32, 24, 0).unwrap()
    }

    fn ndjson_line(code: i64, audio: Option<&[u8]>) -> String {
        let data = audio
            .map(|a| base64::engine::general_purpose::STANDARD.encode(a))
            .unwrap_or_default();
        json!({"code": code, "message": "", "data": data}).to_string()
    }

    struct Services {
        chat_status: StatusCode,
        tts_body: String,
        prompts: Arc<Mutex<Vec<String>>>,
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl Services {
        fn new(chat_status: StatusCode, tts_body: String) -> Self {
            Self {
                chat_status,
                tts_body,
                prompts: Arc::default(),
                spoken: Arc::default(),
            }
        }

        async fn spawn(&self) -> String {
            let chat_status = self.chat_status;
            let tts_body = self.tts_body.clone();
            let prompts = Arc::clone(&self.prompts);
            let spoken = Arc::clone(&self.spoken);

            let app = Router::new()
                .route(
                    "/geo",
                    get(|| async {
                        Json(json!({
                            "city": "Hangzhou",
                            "country": "China",
                            "latitude": 30.29,
                            "longitude": 120.16
                        }))
                    }),
                )
                .route(
                    "/weather",
                    get(|| async {
                        Json(json!({
                            "weather": [{"description": "小雨"}],
                            "main": {"temp": 18.25, "feels_like": 17.9, "humidity": 80},
                            "wind": {"speed": 2}
                        }))
                    }),
                )
                .route(
                    "/analyze",
                    post(|| async { Json(json!({"results": [{"dominant_emotion": "happy"}]})) }),
                )
                .route(
                    "/chat",
                    post(move |Json(body): Json<Value>| {
                        let prompts = Arc::clone(&prompts);
                        async move {
                            let prompt = body["messages"][0]["content"][0]["text"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string();
                            prompts.lock().unwrap().push(prompt);
                            if chat_status != StatusCode::OK {
                                return Err(chat_status);
                            }
                            Ok(Json(json!({"choices": [{"message": {"content": "今天的搭配真好看!"}}]})))
                        }
                    }),
                )
                .route(
                    "/tts",
                    post(move |Json(body): Json<Value>| {
                        let spoken = Arc::clone(&spoken);
                        let tts_body = tts_body.clone();
                        async move {
                            let text = body["req_params"]["text"].as_str().unwrap_or_default();
                            spoken.lock().unwrap().push(text.to_string());
                            Response::builder()
                                .header("X-Tt-Logid", "test-log")
                                .body(Body::from(tts_body))
                                .unwrap()
                        }
                    }),
                );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }
    }

    fn config(base: &str) -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.location.url = Some(format!("{base}/geo"));
        config.weather.url = format!("{base}/weather");
        config.weather.api_key = Some("weather-key".into());
        config.emotion.url = format!("{base}/analyze");
        config.vision.url = format!("{base}/chat");
        config.vision.api_key = Some("vision-key".into());
        config.tts.url = format!("{base}/tts");
        config.tts.app_id = Some("app".into());
        config.tts.access_key = Some("access".into());
        config
    }

    async fn run_job(services: &Services) -> (JobReport, Vec<Vec<u8>>) {
        let base = services.spawn().await;
        let recorder = Recorder::default();
        let played = Arc::clone(&recorder.0);
        let playback = Arc::new(PlaybackQueue::new(recorder, Duration::from_millis(1)));
        let pipeline = ComplimentPipeline::from_config(&config(&base), Arc::clone(&playback)).unwrap();

        let report = pipeline
            .run(ComplimentJob::new(frame(), Instant::now()))
            .await
            .unwrap();
        assert!(playback.wait_drained(Duration::from_secs(5)));
        let played = played.lock().unwrap().clone();
        (report, played)
    }

    #[tokio::test]
    async fn test_pipeline_speaks_genuine_compliment() {
        let tts_body = [
            ndjson_line(0, Some(b"chunk-1")),
            ndjson_line(0, Some(b"chunk-2")),
            ndjson_line(0, Some(b"chunk-3")),
            ndjson_line(20_000_000, None),
        ]
        .join("\n");
        let services = Services::new(StatusCode::OK, tts_body);
        let (report, played) = run_job(&services).await;

        assert_eq!(report.compliment, Compliment::Genuine("今天的搭配真好看!".into()));
        let audio = report.audio.unwrap();
        assert!(audio.completed);
        assert_eq!(audio.chunks, 3);
        assert_eq!(
            played,
            vec![b"chunk-1".to_vec(), b"chunk-2".to_vec(), b"chunk-3".to_vec()]
        );

        let prompt = services.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("小雨"));
        assert!(prompt.contains("18.2℃") || prompt.contains("18.3℃"));
        assert!(prompt.contains("Hangzhou"));
        assert!(prompt.contains("happy"));
        assert_eq!(*services.spoken.lock().unwrap(), vec!["今天的搭配真好看!".to_string()]);
    }

    #[tokio::test]
    async fn test_pipeline_falls_back_when_chat_fails() {
        let tts_body = [ndjson_line(0, Some(b"fallback-audio")), ndjson_line(20_000_000, None)].join("\n");
        let services = Services::new(StatusCode::INTERNAL_SERVER_ERROR, tts_body);
        let (report, played) = run_job(&services).await;

        assert!(report.compliment.is_degraded());
        assert!(FALLBACK_COMPLIMENTS.contains(&report.compliment.text()));
        assert!(report.audio.is_ok());
        assert_eq!(played, vec![b"fallback-audio".to_vec()]);
        assert_eq!(
            *services.spoken.lock().unwrap(),
            vec![report.compliment.text().to_string()]
        );
    }

    #[tokio::test]
    async fn test_pipeline_reports_tts_error() {
        let tts_body = [
            ndjson_line(0, Some(b"partial")),
            json!({"code": 55000000, "message": "server busy"}).to_string(),
        ]
        .join("\n");
        let services = Services::new(StatusCode::OK, tts_body);
        let (report, played) = run_job(&services).await;

        assert!(!report.compliment.is_degraded());
        assert!(matches!(report.audio, Err(NetError::Remote { code: 55_000_000, .. })));
        assert_eq!(played, vec![b"partial".to_vec()]);
    }

    /// Counts concurrent runs instead of calling any service.
    #[derive(Default)]
    struct SlowRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
        finished: Mutex<Vec<Uuid>>,
    }

    impl JobRunner for SlowRunner {
        fn run(&self, job: ComplimentJob) -> impl Future<Output = Result<JobReport, JobError>> + Send {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.finished.lock().unwrap().push(job.id);
                Ok(JobReport {
                    id: job.id,
                    compliment: Compliment::Genuine("ok".into()),
                    audio: Ok(SpeechOutcome::default()),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_pool_limits_concurrency() {
        let runner = Arc::new(SlowRunner::default());
        let pool = WorkerPool::spawn(Arc::clone(&runner), &WorkerSettings { count: 2, queue: 8 });
        let tx = pool.sender();
        for _ in 0..6 {
            tx.send(ComplimentJob::new(frame(), Instant::now())).await.unwrap();
        }
        drop(tx);
        pool.shutdown().await;

        assert_eq!(runner.finished.lock().unwrap().len(), 6);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_queue_is_bounded() {
        let runner = Arc::new(SlowRunner::default());
        let pool = WorkerPool::spawn(Arc::clone(&runner), &WorkerSettings { count: 1, queue: 1 });
        let tx = pool.sender();

        tx.try_send(ComplimentJob::new(frame(), Instant::now())).unwrap();
        // Let the dispatcher hand the first job to the worker
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.try_send(ComplimentJob::new(frame(), Instant::now())).unwrap();
        assert!(matches!(
            tx.try_send(ComplimentJob::new(frame(), Instant::now())),
            Err(mpsc::error::TrySendError::Full(_))
        ));

        drop(tx);
        pool.shutdown().await;
        assert_eq!(runner.finished.lock().unwrap().len(), 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_reports_closed_permits() {
        let permits = Arc::new(Semaphore::new(2));
        let held = Arc::clone(&permits).acquire_owned().await.unwrap();

        let waiter = tokio::spawn({
            let permits = Arc::clone(&permits);
            async move { wait_idle(&permits, 2).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.await.unwrap());

        permits.close();
        assert!(!wait_idle(&permits, 2).await);
    }
}
