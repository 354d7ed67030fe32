//! Dominant-emotion lookup against a DeepFace-style `/analyze` service.

use std::time::Duration;

use base64::Engine as _;
use mirror_core::config::EmotionSettings;
use mirror_core::EmotionReading;
use serde::{Deserialize, Serialize};

use crate::client::{build_client, check_status, NetError};

const SERVICE: &str = "emotion";

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    img: String,
    actions: [&'a str; 1],
    detector_backend: &'a str,
    enforce_detection: bool,
    align: bool,
}

#[derive(Debug, Deserialize)]
struct FaceResult {
    dominant_emotion: Option<String>,
}

/// The service wraps results in an object; older versions return a bare list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnalyzeResponse {
    Wrapped { results: Vec<FaceResult> },
    Bare(Vec<FaceResult>),
}

impl AnalyzeResponse {
    fn dominant(self) -> Option<String> {
        let results = match self {
            Self::Wrapped { results } | Self::Bare(results) => results,
        };
        results.into_iter().next()?.dominant_emotion
    }
}

pub struct EmotionClient {
    http: reqwest::Client,
    url: String,
    detector_backend: String,
}

impl EmotionClient {
    pub fn new(settings: &EmotionSettings) -> Result<Self, NetError> {
        Ok(Self {
            http: build_client(Duration::from_secs(settings.timeout_secs))?,
            url: settings.url.clone(),
            detector_backend: settings.detector_backend.clone(),
        })
    }

    /// Dominant emotion of the first face in a JPEG image.
    pub async fn analyze(&self, jpeg: &[u8]) -> Result<String, NetError> {
        let request = AnalyzeRequest {
            img: format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(jpeg)
            ),
            actions: ["emotion"],
            detector_backend: &self.detector_backend,
            enforce_detection: false,
            align: true,
        };
        let response = self.http.post(&self.url).json(&request).send().await?;
        let response = check_status(SERVICE, response).await?;
        let body: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| NetError::malformed(SERVICE, e.to_string()))?;
        body.dominant()
            .ok_or_else(|| NetError::malformed(SERVICE, "no face result"))
    }

    /// [`analyze`](Self::analyze), with failures carried in the reading.
    pub async fn reading(&self, jpeg: &[u8]) -> EmotionReading {
        match self.analyze(jpeg).await {
            Ok(label) => EmotionReading::Dominant(label),
            Err(e) => {
                tracing::warn!(error = %e, "emotion analysis failed");
                EmotionReading::unavailable(e.to_string())
            }
        }
    }
}
