// Ollama chat client - horoscope text generation
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StageError;
use crate::types::ContentUnit;
use crate::workflow::stages::TextGenerator;

const SERVICE: &str = "Ollama";

#[derive(Clone)]
pub struct OllamaTextGenerator {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize, Deserialize, Debug)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize, Debug)]
struct ChatOptions {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    message: ChatMessage,
}

impl OllamaTextGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

/// French horoscope prompt for one sign and date
pub fn horoscope_prompt(unit: &ContentUnit) -> String {
    let name = unit.sign.display_name();
    format!(
        "Tu es un astrologue expert et bienveillant. Écris un horoscope court et engageant pour le signe {name} pour le {date}.\n\n\
         INSTRUCTIONS:\n\
         - Horoscope de 60-90 mots maximum.\n\
         - Ta réponse doit être en français uniquement.\n\
         - Ton moderne, bienveillant et motivant.\n\
         - Donne 1 conseil pratique adapté au signe.\n\
         - Commence par \"Cher {name},\"\n\n\
         Réponds UNIQUEMENT avec le texte de l'horoscope.",
        name = name,
        date = unit.date.format("%d/%m/%Y"),
    )
}

#[async_trait]
impl TextGenerator for OllamaTextGenerator {
    async fn generate(&self, unit: &ContentUnit) -> Result<String, StageError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: horoscope_prompt(unit),
            }],
            stream: false,
            options: ChatOptions {
                temperature: 0.7,
                top_p: 0.9,
                num_predict: 200,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        let text = parsed.message.content.trim().to_string();
        tracing::debug!(unit = %unit, words = text.split_whitespace().count(), "horoscope generated");
        Ok(text)
    }
}
