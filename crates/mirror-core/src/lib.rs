//! mirror-core: Shared model and decision logic for the compliment mirror.
//!
//! Holds the data model exchanged between the capture loop, the remote
//! clients and the playback side, the cooldown gate that rations compliment
//! jobs, prompt rendering, configuration loading, and SCRFD-based face
//! presence detection via ONNX Runtime.

pub mod config;
pub mod cooldown;
pub mod detector;
pub mod prompt;
pub mod types;

pub use config::{ConfigError, MirrorConfig};
pub use cooldown::{CooldownGate, CooldownTicket};
pub use detector::{DetectorError, HumanDetector, ScrfdDetector};
pub use types::{
    Compliment, Detection, EmotionReading, LocationInfo, WeatherInfo, WeatherReport,
};
