use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Full mirror configuration.
///
/// Loaded from a TOML file, then overridden by `MIRROR_*` environment
/// variables. Every field has a default so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub workers: WorkerSettings,
    pub location: LocationSettings,
    pub weather: WeatherSettings,
    pub emotion: EmotionSettings,
    pub vision: VisionSettings,
    pub tts: TtsSettings,
    pub audio: AudioSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// V4L2 device path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// The mirror's camera is mounted upside down, hence both flips on.
    pub hflip: bool,
    pub vflip: bool,
    /// Frames discarded after streaming starts (AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            hflip: true,
            vflip: true,
            warmup_frames: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// SCRFD ONNX model file.
    pub model_path: PathBuf,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Faces smaller than this (pixels, either side) are ignored.
    pub min_face_size: f32,
    pub poll_interval_ms: u64,
    pub cooldown_secs: u64,
    pub skip_dark_frames: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            score_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 30.0,
            poll_interval_ms: 100,
            cooldown_secs: 45,
            skip_dark_frames: true,
        }
    }
}

impl DetectionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Jobs processed concurrently.
    pub count: usize,
    /// Jobs allowed to wait for a free worker.
    pub queue: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { count: 1, queue: 1 }
    }
}

/// Which IP geolocation service to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationProvider {
    /// api.ip.sb, which rejects requests that do not look like a browser.
    IpSb,
    /// ipapi.co, which reports the country as `country_name`.
    IpApi,
}

impl LocationProvider {
    pub fn default_url(self) -> &'static str {
        match self {
            Self::IpSb => "https://api.ip.sb/geoip/",
            Self::IpApi => "https://ipapi.co/json/",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    pub provider: LocationProvider,
    /// Overrides the provider's default endpoint.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            provider: LocationProvider::IpSb,
            url: None,
            timeout_secs: 10,
        }
    }
}

impl LocationSettings {
    pub fn endpoint(&self) -> &str {
        self.url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_url())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub units: String,
    pub lang: String,
    pub timeout_secs: u64,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            api_key: None,
            units: "metric".to_string(),
            lang: "zh_cn".to_string(),
            timeout_secs: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmotionSettings {
    /// DeepFace-compatible `/analyze` endpoint.
    pub url: String,
    pub detector_backend: String,
    pub timeout_secs: u64,
}

impl Default for EmotionSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5005/analyze".to_string(),
            detector_backend: "opencv".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionSettings {
    /// OpenAI-compatible chat completions endpoint.
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub jpeg_quality: u8,
    /// Replaces the built-in prompt; same placeholders.
    pub prompt_template: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            url: "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string(),
            api_key: None,
            model: "doubao-seed-1-6-251015".to_string(),
            max_tokens: 300,
            temperature: 0.7,
            jpeg_quality: 80,
            prompt_template: None,
            timeout_secs: 30,
        }
    }
}

impl VisionSettings {
    pub fn template(&self) -> &str {
        self.prompt_template
            .as_deref()
            .unwrap_or(crate::prompt::DEFAULT_TEMPLATE)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub url: String,
    pub app_id: Option<String>,
    pub access_key: Option<String>,
    pub resource_id: String,
    pub speaker: String,
    pub format: String,
    pub sample_rate: u32,
    pub language: String,
    pub timeout_secs: u64,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            url: "https://openspeech.bytedance.com/api/v3/tts/unidirectional".to_string(),
            app_id: None,
            access_key: None,
            resource_id: "seed-tts-2.0".to_string(),
            speaker: "zh_female_meilinvyou_saturn_bigtts".to_string(),
            format: "mp3".to_string(),
            sample_rate: 24_000,
            language: "zh".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// How long the playback thread sleeps when the queue is empty.
    pub idle_poll_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self { idle_poll_ms: 5 }
    }
}

impl AudioSettings {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl MirrorConfig {
    /// Load the config file (if any) and apply environment overrides.
    ///
    /// The file is `$MIRROR_CONFIG`, else `$XDG_CONFIG_HOME/mirror/config.toml`.
    /// A missing default file is not an error; a missing explicit one is.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("MIRROR_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!(path = %path.display(), "no config file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override selected fields from `MIRROR_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(device) = std::env::var("MIRROR_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Ok(path) = std::env::var("MIRROR_MODEL_PATH") {
            self.detection.model_path = PathBuf::from(path);
        }
        self.detection.cooldown_secs = env_u64("MIRROR_COOLDOWN_SECS", self.detection.cooldown_secs);
        self.workers.count = env_usize("MIRROR_WORKERS", self.workers.count);
        self.camera.warmup_frames = env_usize("MIRROR_WARMUP_FRAMES", self.camera.warmup_frames);
        self.detection.score_threshold =
            env_f32("MIRROR_SCORE_THRESHOLD", self.detection.score_threshold);

        override_secret(&mut self.weather.api_key, "MIRROR_WEATHER_API_KEY");
        override_secret(&mut self.vision.api_key, "MIRROR_VISION_API_KEY");
        override_secret(&mut self.tts.app_id, "MIRROR_TTS_APP_ID");
        override_secret(&mut self.tts.access_key, "MIRROR_TTS_ACCESS_KEY");
    }
}

fn override_secret(slot: &mut Option<String>, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.is_empty() {
            *slot = Some(value);
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("mirror")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `$XDG_CONFIG_HOME/mirror/config.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("mirror/config.toml")
}

/// SCRFD model location under the data directory.
pub fn default_model_path() -> PathBuf {
    data_dir().join("models/det_10g.onnx")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
