use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;

use crate::audio::codec::decode_base64;
use crate::config::NarrationConfig;
use crate::error::{AudioError, Result};
use crate::protocol::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig};

/// Remote text-to-speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Raw little-endian PCM16 for `text`, at the narration rate.
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Gemini `generateContent` with an audio response modality.
pub struct GeminiTts {
    client: Client,
    url: String,
    voice: String,
    api_key: String,
}

impl GeminiTts {
    pub fn new(config: &NarrationConfig, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            url: format!(
                "{}/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            voice: config.voice.clone(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiTts {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        if self.api_key.is_empty() {
            return Err(AudioError::Transport("no API key configured".into()));
        }

        let body = GenerateContentRequest {
            contents: vec![Content::text(text)],
            generation_config: GenerationConfig::audio(&self.voice),
        };

        log::debug!("TTS request: {} chars", text.chars().count());

        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AudioError::Transport(format!("HTTP Error: {}", resp.status())));
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| AudioError::Decode(format!("JSON parse error: {}", e)))?;

        let audio = parsed
            .first_audio()
            .ok_or_else(|| AudioError::Decode("No audio data returned".into()))?;

        Ok(Bytes::from(decode_base64(audio)?))
    }
}
