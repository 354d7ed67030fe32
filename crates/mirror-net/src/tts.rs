//! Streaming speech synthesis.
//!
//! The service answers a single POST with newline-delimited JSON. Audio comes
//! base64-encoded in `data`, sentence metadata in `sentence`, and the stream
//! closes with the code [`END_OF_STREAM`]. Each decoded audio chunk goes to the
//! caller's callback as soon as its line is complete, so playback can start
//! long before synthesis finishes.

use std::time::Duration;

use base64::Engine as _;
use futures::StreamExt;
use mirror_core::config::TtsSettings;
use serde::{Deserialize, Serialize};

use crate::client::{build_streaming_client, check_status, require, NetError};

const SERVICE: &str = "tts";

/// Status code that marks a successfully finished stream.
pub const END_OF_STREAM: i64 = 20_000_000;

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    req_params: ReqParams<'a>,
}

#[derive(Debug, Serialize)]
struct ReqParams<'a> {
    text: &'a str,
    speaker: &'a str,
    audio_params: AudioParams<'a>,
    /// JSON object serialized into a string; the service expects it that way.
    additions: String,
}

#[derive(Debug, Serialize)]
struct AudioParams<'a> {
    format: &'a str,
    sample_rate: u32,
    enable_timestamp: bool,
}

#[derive(Debug, Serialize)]
struct Additions<'a> {
    explicit_language: &'a str,
    disable_markdown_filter: bool,
    enable_timestamp: bool,
}

/// One NDJSON line as sent by the service.
#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    sentence: Option<serde_json::Value>,
}

/// What a stream line means to the reader loop.
#[derive(Debug, PartialEq)]
pub enum TtsMessage {
    Audio(Vec<u8>),
    Sentence(String),
    End,
    Error { code: i64, message: String },
    /// Parsed but carries nothing actionable.
    Ignored,
}

/// Classify one line. `Ok(None)` means the line was blank.
pub fn parse_line(line: &str) -> Result<Option<TtsMessage>, NetError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: RawMessage = serde_json::from_str(line)?;
    Ok(Some(raw.classify()?))
}

impl RawMessage {
    fn classify(self) -> Result<TtsMessage, NetError> {
        match self.code {
            0 => {
                if let Some(data) = self.data.filter(|d| !d.is_empty()) {
                    let audio = base64::engine::general_purpose::STANDARD
                        .decode(data.as_bytes())
                        .map_err(|e| NetError::malformed(SERVICE, format!("bad audio chunk: {e}")))?;
                    return Ok(TtsMessage::Audio(audio));
                }
                match self.sentence {
                    Some(serde_json::Value::Null) | None => Ok(TtsMessage::Ignored),
                    Some(serde_json::Value::String(s)) if s.is_empty() => Ok(TtsMessage::Ignored),
                    Some(serde_json::Value::String(s)) => Ok(TtsMessage::Sentence(s)),
                    Some(other) => Ok(TtsMessage::Sentence(other.to_string())),
                }
            }
            END_OF_STREAM => Ok(TtsMessage::End),
            code if code > 0 => Ok(TtsMessage::Error {
                code,
                message: self.message.unwrap_or_default(),
            }),
            _ => Ok(TtsMessage::Ignored),
        }
    }
}

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream closed without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Summary of one synthesis stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeechOutcome {
    pub chunks: usize,
    pub bytes: usize,
    /// Whether the end-of-stream code arrived before the connection closed.
    pub completed: bool,
}

pub struct TtsClient {
    http: reqwest::Client,
    settings: TtsSettings,
}

impl TtsClient {
    pub fn new(settings: &TtsSettings) -> Result<Self, NetError> {
        Ok(Self {
            http: build_streaming_client(Duration::from_secs(settings.timeout_secs))?,
            settings: settings.clone(),
        })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> Result<SynthesisRequest<'a>, NetError> {
        let additions = serde_json::to_string(&Additions {
            explicit_language: &self.settings.language,
            disable_markdown_filter: true,
            enable_timestamp: true,
        })?;
        Ok(SynthesisRequest {
            req_params: ReqParams {
                text,
                speaker: &self.settings.speaker,
                audio_params: AudioParams {
                    format: &self.settings.format,
                    sample_rate: self.settings.sample_rate,
                    enable_timestamp: true,
                },
                additions,
            },
        })
    }

    /// Synthesize `text`, handing each audio chunk to `on_chunk` in stream
    /// order.
    ///
    /// Returns an error if the request fails or the service reports an error
    /// code mid-stream; chunks delivered before that are not taken back.
    pub async fn speak<F>(&self, text: &str, mut on_chunk: F) -> Result<SpeechOutcome, NetError>
    where
        F: FnMut(Vec<u8>),
    {
        let app_id = require(&self.settings.app_id, "TTS app id")?;
        let access_key = require(&self.settings.access_key, "TTS access key")?;
        let body = self.request_body(text)?;

        let response = self
            .http
            .post(&self.settings.url)
            .header("X-Api-App-Id", app_id)
            .header("X-Api-Access-Key", access_key)
            .header("X-Api-Resource-Id", &self.settings.resource_id)
            .json(&body)
            .send()
            .await?;
        let log_id = response
            .headers()
            .get("X-Tt-Logid")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        tracing::info!(log_id = %log_id, status = %response.status(), "TTS stream opened");
        let response = check_status(SERVICE, response).await?;

        let mut outcome = SpeechOutcome::default();
        let mut lines = LineBuffer::default();
        let mut stream = response.bytes_stream();

        'read: while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            for line in lines.push(&bytes) {
                if handle_line(&line, &mut outcome, &mut on_chunk)? {
                    break 'read;
                }
            }
        }
        if !outcome.completed {
            if let Some(line) = lines.finish() {
                handle_line(&line, &mut outcome, &mut on_chunk)?;
            }
        }

        if outcome.completed {
            tracing::info!(chunks = outcome.chunks, bytes = outcome.bytes, "TTS stream finished");
        } else {
            tracing::warn!(
                chunks = outcome.chunks,
                "TTS stream closed without end marker"
            );
        }
        Ok(outcome)
    }
}

/// Apply one line to the running outcome. Returns `true` at end of stream.
fn handle_line<F>(line: &str, outcome: &mut SpeechOutcome, on_chunk: &mut F) -> Result<bool, NetError>
where
    F: FnMut(Vec<u8>),
{
    match parse_line(line) {
        Ok(None) | Ok(Some(TtsMessage::Ignored)) => Ok(false),
        Ok(Some(TtsMessage::Audio(audio))) => {
            tracing::debug!(bytes = audio.len(), "audio chunk received");
            outcome.chunks += 1;
            outcome.bytes += audio.len();
            on_chunk(audio);
            Ok(false)
        }
        Ok(Some(TtsMessage::Sentence(sentence))) => {
            tracing::debug!(sentence = %sentence, "TTS sentence");
            Ok(false)
        }
        Ok(Some(TtsMessage::End)) => {
            outcome.completed = true;
            Ok(true)
        }
        Ok(Some(TtsMessage::Error { code, message })) => {
            tracing::error!(code, message = %message, "TTS error response");
            Err(NetError::Remote {
                service: SERVICE,
                code,
                message,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "skipping unreadable TTS line");
            Ok(false)
        }
    }
}
