// Whisper transcription client (OpenAI-compatible /v1/audio/transcriptions)
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::StageError;
use crate::types::{Artifact, TranscriptionResult, WordTiming};
use crate::workflow::stages::Transcriber;

const SERVICE: &str = "Whisper";

#[derive(Clone)]
pub struct WhisperTranscriber {
    client: Client,
    base_url: String,
    model: String,
    language: String,
}

#[derive(Deserialize, Debug)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    words: Vec<VerboseWord>,
}

#[derive(Deserialize, Debug)]
struct VerboseWord {
    word: String,
    start: f64,
    end: f64,
}

impl WhisperTranscriber {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: "whisper-1".to_string(),
            language: "fr".to_string(),
        }
    }
}

fn into_result(raw: VerboseTranscription) -> TranscriptionResult {
    let words: Vec<WordTiming> = raw
        .words
        .into_iter()
        .map(|w| WordTiming {
            word: w.word.trim().to_string(),
            start: w.start,
            end: w.end.max(w.start),
        })
        .filter(|w| !w.word.is_empty())
        .collect();

    let last_end = words.last().map(|w| w.end).unwrap_or(0.0);
    TranscriptionResult {
        text: raw.text.trim().to_string(),
        duration: raw.duration.unwrap_or(last_end).max(last_end),
        words,
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &Artifact) -> Result<TranscriptionResult, StageError> {
        let bytes = tokio::fs::read(&audio.location)
            .await
            .map_err(|e| StageError::Validation(format!("Cannot read audio {}: {}", audio.location, e)))?;
        let file_name = std::path::Path::new(&audio.location)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "voice.mp3".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| StageError::Validation(format!("Invalid audio part: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }

        let raw: VerboseTranscription = response.json().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        let result = into_result(raw);
        tracing::debug!(words = result.words.len(), duration = result.duration, "transcription received");
        Ok(result)
    }
}
