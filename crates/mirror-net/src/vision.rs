//! Outfit compliments from an OpenAI-compatible multimodal chat endpoint.

use std::time::Duration;

use base64::Engine as _;
use mirror_core::config::VisionSettings;
use mirror_core::prompt::fallback_compliment;
use mirror_core::Compliment;
use serde::{Deserialize, Serialize};

use crate::client::{build_client, check_status, require, NetError};

const SERVICE: &str = "vision";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: [ContentPart<'a>; 2],
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn text(self) -> Result<String, NetError> {
        let content = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| NetError::malformed(SERVICE, "no choices"))?
            .message
            .content
            .unwrap_or_default();
        let content = content.trim();
        if content.is_empty() {
            return Err(NetError::malformed(SERVICE, "empty content"));
        }
        Ok(content.to_string())
    }
}

pub struct VisionClient {
    http: reqwest::Client,
    settings: VisionSettings,
}

impl VisionClient {
    pub fn new(settings: &VisionSettings) -> Result<Self, NetError> {
        Ok(Self {
            http: build_client(Duration::from_secs(settings.timeout_secs))?,
            settings: settings.clone(),
        })
    }

    pub fn settings(&self) -> &VisionSettings {
        &self.settings
    }

    /// Ask the model for a compliment about the person in `jpeg`.
    pub async fn compliment(&self, prompt: &str, jpeg: &[u8]) -> Result<String, NetError> {
        let api_key = require(&self.settings.api_key, "vision API key")?;
        let image_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(jpeg)
        );
        let request = ChatRequest {
            model: &self.settings.model,
            messages: [ChatMessage {
                role: "user",
                content: [
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url },
                    },
                ],
            }],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let response = self
            .http
            .post(&self.settings.url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| NetError::malformed(SERVICE, e.to_string()))?;
        body.text()
    }

    /// [`compliment`](Self::compliment), substituting a canned compliment on
    /// any failure.
    pub async fn compliment_or_fallback(&self, prompt: &str, jpeg: &[u8]) -> Compliment {
        match self.compliment(prompt, jpeg).await {
            Ok(text) => {
                tracing::info!(compliment = %text, "compliment generated");
                Compliment::Genuine(text)
            }
            Err(e) => {
                let text = fallback_compliment(&mut rand::thread_rng()).to_string();
                tracing::warn!(error = %e, compliment = %text, "vision call failed, using fallback");
                Compliment::Degraded {
                    text,
                    reason: e.to_string(),
                }
            }
        }
    }
}
