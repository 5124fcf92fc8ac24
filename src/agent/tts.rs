//! # Speech Synthesis Client
//!
//! Turns assistant text into raw 16-bit PCM via the Deepgram speak API.
//! `container=none` strips the WAV header so the bytes can go straight into
//! the base64 audio envelope at the session's negotiated sample rate.
//!
//! Same retry policy as the chat backend: one retry for retryable failures,
//! then report.

use crate::error::{AgentError, UpstreamService};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Seam between the session pipeline and the TTS service, mockable in tests.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text into raw PCM. Empty or whitespace-only text yields an
    /// empty buffer without an upstream call.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError>;
}

/// Deepgram text-to-speech over HTTP.
pub struct DeepgramTts {
    client: Client,
    base_url: String,
    api_key: String,
    voice: String,
    sample_rate: u32,
}

impl DeepgramTts {
    pub fn new(
        api_key: impl Into<String>,
        voice: impl Into<String>,
        sample_rate: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: "https://api.deepgram.com".to_string(),
            api_key: api_key.into(),
            voice: voice.into(),
            sample_rate,
        }
    }

    /// Point at a different host (self-hosted Deepgram, test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn speak_url(&self) -> String {
        format!(
            "{}/v1/speak?model={}&encoding=linear16&sample_rate={}&container=none",
            self.base_url.trim_end_matches('/'),
            self.voice,
            self.sample_rate
        )
    }

    async fn send_request(&self, text: &str) -> Result<Vec<u8>, (String, bool)> {
        let response = self
            .client
            .post(self.speak_url())
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|err| {
                (
                    format!("Synthesis request failed: {}", err),
                    err.is_connect() || err.is_timeout(),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let is_retryable = matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            );
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read synthesis error body".to_string());
            return Err((
                format!("Synthesis API returned {}: {}", status.as_u16(), body),
                is_retryable,
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| (format!("Failed to read synthesis audio: {}", err), false))?;

        debug!(bytes = bytes.len(), "Synthesized speech");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for DeepgramTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self.send_request(text).await {
            Ok(bytes) => Ok(bytes),
            Err((message, true)) => {
                warn!(error = %message, "Synthesis failed, retrying once");
                tokio::time::sleep(RETRY_PAUSE).await;
                self.send_request(text)
                    .await
                    .map_err(|(message, _)| AgentError::Upstream {
                        service: UpstreamService::Synthesis,
                        message,
                    })
            }
            Err((message, false)) => Err(AgentError::Upstream {
                service: UpstreamService::Synthesis,
                message,
            }),
        }
    }
}
