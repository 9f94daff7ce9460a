// Eleven Labs API Client - voice-over synthesis
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::path::Path;

use crate::error::StageError;
use crate::types::{ArtifactKind, VoiceOptions};
use crate::utils::probe_duration;
use crate::workflow::artifacts::ArtifactDraft;
use crate::workflow::stages::SpeechSynthesizer;

const SERVICE: &str = "Eleven Labs";

#[derive(Clone)]
pub struct ElevenLabsSynthesizer {
    api_key: String,
    default_voice_id: String,
    client: Client,
    base_url: String,
}

// ============================================================================
// API REQUEST STRUCTURES
// ============================================================================

#[derive(Serialize, Debug)]
pub struct TextToSpeechRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<VoiceSettings>,
}

#[derive(Serialize, Debug)]
pub struct VoiceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_boost: Option<f64>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ElevenLabsSynthesizer {
    pub fn new(api_key: String, default_voice_id: String) -> Self {
        Self {
            api_key,
            default_voice_id,
            client: Client::new(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
        }
    }

    fn build_request(text: &str, voice: &VoiceOptions) -> TextToSpeechRequest {
        let voice_settings = if voice.stability.is_some() || voice.similarity_boost.is_some() {
            Some(VoiceSettings {
                stability: voice.stability,
                similarity_boost: voice.similarity_boost,
            })
        } else {
            None
        };
        TextToSpeechRequest {
            text: text.to_string(),
            model_id: Some(voice.model_id.clone().unwrap_or_else(|| "eleven_multilingual_v2".to_string())),
            language_code: None,
            voice_settings,
        }
    }

    /// Generate speech from text, MP3 bytes
    async fn text_to_speech(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, StageError> {
        let voice_id = voice.voice_id.as_deref().unwrap_or(&self.default_voice_id);
        let url = format!("{}/text-to-speech/{}", self.base_url, voice_id);

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .query(&[("output_format", "mp3_44100_128")])
            .json(&Self::build_request(text, voice))
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }

        let audio_bytes = response.bytes().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        Ok(audio_bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceOptions, out_dir: &Path) -> Result<ArtifactDraft, StageError> {
        let bytes = self.text_to_speech(text, voice).await?;
        if bytes.is_empty() {
            return Err(StageError::EmptyResult(format!("{} returned no audio", SERVICE)));
        }

        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| StageError::Transient(format!("Failed to create {}: {}", out_dir.display(), e)))?;
        let path = out_dir.join("voice.mp3");
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StageError::Transient(format!("Failed to write {}: {}", path.display(), e)))?;

        let duration = probe_duration(&path).await.map_err(StageError::Validation)?;
        tracing::info!(path = %path.display(), duration, "🎙️ voice-over written");
        Ok(ArtifactDraft::from_bytes(ArtifactKind::Audio, path.display().to_string(), &bytes).with_duration(duration))
    }
}
