use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mirror_core::detector::DetectorSettings;
use mirror_core::prompt::{timestamp_now, PromptContext};
use mirror_core::{HumanDetector, MirrorConfig, ScrfdDetector, WeatherReport};
use mirror_hw::{AudioOutput, Camera, CaptureFormat, Frame, FrameSource, PlaybackQueue};
use mirror_net::weather::current_weather;
use mirror_net::{EmotionClient, LocationClient, TtsClient, VisionClient, WeatherClient};

/// Upper bound on waiting for queued speech after the stream ends.
const PLAYBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "mirror", about = "Compliment mirror CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where this machine appears to be
    Location,
    /// Show the current weather here
    Weather,
    /// Show the local time as used in prompts
    Time,
    /// Dominant emotion of the person in an image
    Emotion {
        /// JPEG or PNG file
        image: PathBuf,
    },
    /// Generate a compliment for an image
    Compliment {
        image: PathBuf,
        /// Also speak it through the speaker
        #[arg(long)]
        speak: bool,
    },
    /// Speak text through streaming TTS
    Speak { text: String },
    /// List V4L2 capture devices
    Devices,
    /// Run the camera and face detector for a few frames
    Detect {
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = MirrorConfig::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Location => {
            let client = LocationClient::new(&config.location)?;
            let location = client.locate().await.context("location lookup failed")?;
            println!("当前位置信息: {}", serde_json::to_string_pretty(&location)?);
        }
        Commands::Weather => {
            let location = LocationClient::new(&config.location)?;
            let weather = WeatherClient::new(&config.weather)?;
            let report = current_weather(&location, &weather).await;
            for line in weather_lines(&report) {
                println!("{line}");
            }
        }
        Commands::Time => {
            println!("当前时间: {}", timestamp_now());
        }
        Commands::Emotion { image } => {
            let jpeg = load_jpeg(&image, config.vision.jpeg_quality)?;
            let client = EmotionClient::new(&config.emotion)?;
            let emotion = client.analyze(&jpeg).await.context("emotion analysis failed")?;
            println!("主导情绪: {emotion}");
        }
        Commands::Compliment { image, speak } => {
            let jpeg = load_jpeg(&image, config.vision.jpeg_quality)?;
            let location = LocationClient::new(&config.location)?;
            let weather = WeatherClient::new(&config.weather)?;
            let emotion = EmotionClient::new(&config.emotion)?;
            let vision = VisionClient::new(&config.vision)?;

            let ((location, weather), emotion) = tokio::join!(
                async {
                    let here = location.locate_or_none().await;
                    let report = weather.report_for(here.as_ref()).await;
                    (here, report)
                },
                emotion.reading(&jpeg),
            );
            let prompt = PromptContext {
                weather,
                location,
                time: timestamp_now(),
                emotion,
            }
            .render(config.vision.template());
            tracing::debug!(prompt = %prompt, "prompt rendered");

            let compliment = vision.compliment_or_fallback(&prompt, &jpeg).await;
            println!("{}", compliment.text());
            if compliment.is_degraded() {
                println!("(fallback compliment: vision call failed)");
            }
            if speak {
                speak_text(&config, compliment.text()).await?;
            }
        }
        Commands::Speak { text } => {
            speak_text(&config, &text).await?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Detect { frames } => {
            tokio::task::spawn_blocking(move || detect(&config, frames)).await??;
        }
    }

    Ok(())
}

/// Human-readable weather block.
fn weather_lines(report: &WeatherReport) -> Vec<String> {
    match report {
        WeatherReport::Unavailable { error } => vec![format!("错误: {error}")],
        WeatherReport::Available(info) => {
            let rule = "=".repeat(40);
            vec![
                rule.clone(),
                format!("当前温度: {}", info.temperature),
                format!("体感温度: {}", info.feels_like),
                format!("天气状况: {}", info.weather),
                format!("湿度: {}", info.humidity),
                format!("风速: {}", info.wind_speed),
                rule,
            ]
        }
    }
}

fn load_frame(path: &Path) -> Result<Frame> {
    let rgb = image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(Frame::from_rgb(rgb.into_raw(), width, height, 0)?)
}

fn load_jpeg(path: &Path, quality: u8) -> Result<Vec<u8>> {
    Ok(load_frame(path)?.encode_jpeg(quality)?)
}

async fn speak_text(config: &MirrorConfig, text: &str) -> Result<()> {
    let client = TtsClient::new(&config.tts)?;
    let speaker = AudioOutput::open().context("failed to open audio output")?;
    println!("Speaking on {}", speaker.device_name());
    let playback = Arc::new(PlaybackQueue::new(speaker, config.audio.idle_poll()));

    let outcome = client
        .speak(text, |chunk| {
            playback.push(chunk);
        })
        .await
        .context("speech synthesis failed")?;
    println!(
        "Received {} chunks ({} bytes){}",
        outcome.chunks,
        outcome.bytes,
        if outcome.completed { "" } else { ", stream ended early" }
    );

    tokio::task::spawn_blocking(move || {
        let drained = playback.wait_drained(PLAYBACK_DRAIN_TIMEOUT);
        playback.stop();
        drained
    })
    .await?
    .then_some(())
    .context("playback did not finish in time")
}

fn detect(config: &MirrorConfig, frames: usize) -> Result<()> {
    if frames == 0 {
        bail!("--frames must be at least 1");
    }
    let mut camera = Camera::open(
        &config.camera.device,
        CaptureFormat {
            width: config.camera.width,
            height: config.camera.height,
            fps: config.camera.fps,
        },
    )?;
    println!(
        "Camera: {} {}x{} {:?}",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );
    let mut detector = ScrfdDetector::load(
        &config.detection.model_path,
        DetectorSettings::from(&config.detection),
    )?;

    camera.start()?;
    camera.warm_up(config.camera.warmup_frames);

    let mut seen = 0;
    for i in 1..=frames {
        let mut frame = match camera.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                println!("frame {i}: capture failed: {e}");
                continue;
            }
        };
        frame.flip(config.camera.hflip, config.camera.vflip);
        if frame.is_dark(0.95) {
            println!("frame {i}: dark");
            continue;
        }
        let faces = detector.detect(&frame.data, frame.width, frame.height)?;
        match faces.first() {
            Some(best) => {
                seen += 1;
                println!(
                    "frame {i}: {} face(s), best score {:.3} at ({:.0}, {:.0}) {:.0}x{:.0}",
                    faces.len(),
                    best.score,
                    best.x,
                    best.y,
                    best.width,
                    best.height
                );
            }
            None => println!("frame {i}: no face"),
        }
    }
    println!("Person present in {seen}/{frames} frames");
    Ok(())
}
