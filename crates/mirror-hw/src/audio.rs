//! MP3 playback on the default output device via `cpal`.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig, SupportedStreamConfigRange};
use thiserror::Error;

/// Extra time allowed past the nominal clip length before giving up.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// Pause after the last sample so the device buffer empties.
const TAIL_DELAY: Duration = Duration::from_millis(50);
const COMPLETION_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no output device available")]
    NoDevice,
    #[error("no usable output config: {0}")]
    Config(String),
    #[error("MP3 decode error: {0}")]
    Decode(String),
    #[error("output stream error: {0}")]
    Stream(String),
}

/// Mono PCM decoded from one MP3 buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Default output device handle.
///
/// Only the device name is kept; the device is looked up again for every
/// clip, so the handle is cheap and `Send`.
pub struct AudioOutput {
    device_name: String,
}

impl AudioOutput {
    /// Probe the default output device.
    pub fn open() -> Result<Self, AudioError> {
        let device = default_device()?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(device = %device_name, "audio output ready");
        Ok(Self { device_name })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Decode MP3 bytes and play them, blocking until done.
    pub fn play_mp3(&self, mp3: &[u8]) -> Result<(), AudioError> {
        let audio = decode_mp3(mp3)?;
        self.play(&audio)
    }

    /// Play mono PCM, blocking until done.
    pub fn play(&self, audio: &DecodedAudio) -> Result<(), AudioError> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let device = default_device()?;
        let (config, samples) = negotiate(&device, audio)?;
        let channels = usize::from(config.channels);
        let total = samples.len();

        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                        if pos >= samples.len() {
                            finished.store(true, Ordering::Release);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| AudioError::Stream(e.to_string()))?
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        let nominal = Duration::from_secs_f64(total as f64 / f64::from(config.sample_rate.0));
        let deadline = Instant::now() + nominal + DRAIN_GRACE;
        while !finished.load(Ordering::Acquire) {
            if Instant::now() > deadline {
                tracing::warn!(
                    played = position.load(Ordering::Relaxed),
                    total,
                    "playback did not finish in time"
                );
                break;
            }
            std::thread::sleep(COMPLETION_POLL);
        }
        std::thread::sleep(TAIL_DELAY);

        drop(stream);
        tracing::debug!(samples = total, "clip played");
        Ok(())
    }
}

fn default_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::NoDevice)
}

/// Choose an output config for `audio`, resampling when the device cannot run
/// at the clip's native rate.
fn negotiate(
    device: &cpal::Device,
    audio: &DecodedAudio,
) -> Result<(StreamConfig, Vec<f32>), AudioError> {
    let wanted = SampleRate(audio.sample_rate);
    let supports = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted
    };

    let native = device
        .supported_output_configs()
        .map_err(|e| AudioError::Config(e.to_string()))?
        .filter(|c| c.channels() <= 2 && supports(c))
        .min_by_key(|c| c.channels());

    if let Some(range) = native {
        return Ok((range.with_sample_rate(wanted).config(), audio.samples.clone()));
    }

    let fallback: StreamConfig = device
        .default_output_config()
        .map_err(|e| AudioError::Config(e.to_string()))?
        .config();
    tracing::debug!(
        from = audio.sample_rate,
        to = fallback.sample_rate.0,
        "resampling clip for output device"
    );
    let samples = resample_linear(&audio.samples, audio.sample_rate, fallback.sample_rate.0);
    Ok((fallback, samples))
}

/// Decode MP3 bytes to mono f32 samples.
pub fn decode_mp3(mp3: &[u8]) -> Result<DecodedAudio, AudioError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                }
                let channels = frame.channels.max(1);
                // Downmix to mono by averaging channels
                samples.extend(frame.data.chunks(channels).map(|chunk| {
                    chunk.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>()
                        / chunk.len() as f32
                }));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => return Err(AudioError::Decode(e.to_string())),
        }
    }

    if samples.is_empty() {
        return Err(AudioError::Decode("no audio frames".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Linear-interpolation resampler, good enough for speech.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let lo = (src.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = (src - lo as f64) as f32;
            samples[lo] * (1.0 - frac) + samples[hi] * frac
        })
        .collect()
}
