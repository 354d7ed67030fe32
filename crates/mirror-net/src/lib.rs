//! mirror-net: Clients for the remote services behind a compliment.
//!
//! Each client owns a `reqwest::Client` with its own timeout and makes
//! exactly one attempt per call. Lookups that feed the prompt (location,
//! weather, emotion) have infallible wrappers that turn errors into tagged
//! values; the vision client degrades to a canned compliment; the TTS client
//! streams audio chunks to a caller-supplied callback.

pub mod client;
pub mod emotion;
pub mod location;
pub mod tts;
pub mod vision;
pub mod weather;

pub use client::NetError;
pub use emotion::EmotionClient;
pub use location::LocationClient;
pub use tts::{SpeechOutcome, TtsClient};
pub use vision::VisionClient;
pub use weather::WeatherClient;
