// Publishing client - multipart upload of the final video to a publishing gateway
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::types::{Artifact, Privacy};
use crate::workflow::stages::{PublishMetadata, Publisher};

const SERVICE: &str = "Publisher";

#[derive(Clone)]
pub struct HttpPublisher {
    client: Client,
    upload_url: String,
    api_token: Option<String>,
}

#[derive(Serialize, Debug)]
struct UploadSnippet<'a> {
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
    privacy: Privacy,
}

#[derive(Deserialize, Debug)]
struct UploadResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl HttpPublisher {
    pub fn new(upload_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            upload_url: upload_url.into(),
            api_token,
        }
    }
}

fn remote_url(response: UploadResponse) -> Result<String, StageError> {
    match (response.url, response.id) {
        (Some(url), _) if !url.is_empty() => Ok(url),
        (_, Some(id)) if !id.is_empty() => Ok(format!("https://youtube.com/shorts/{}", id)),
        _ => Err(StageError::Upload("Upload response carried neither url nor id".to_string())),
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn upload(&self, video: &Artifact, metadata: &PublishMetadata, privacy: Privacy) -> Result<String, StageError> {
        let video_data = tokio::fs::read(&video.location)
            .await
            .map_err(|e| StageError::Upload(format!("Cannot read {}: {}", video.location, e)))?;
        let file_name = std::path::Path::new(&video.location)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video.mp4".to_string());

        let snippet = UploadSnippet {
            title: &metadata.title,
            description: &metadata.description,
            tags: &metadata.tags,
            privacy,
        };
        let metadata_json =
            serde_json::to_string(&snippet).map_err(|e| StageError::Upload(format!("Invalid metadata: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part(
                "snippet",
                reqwest::multipart::Part::text(metadata_json)
                    .mime_str("application/json")
                    .map_err(|e| StageError::Upload(e.to_string()))?,
            )
            .part(
                "media",
                reqwest::multipart::Part::bytes(video_data)
                    .file_name(file_name)
                    .mime_str("video/mp4")
                    .map_err(|e| StageError::Upload(e.to_string()))?,
            );

        let mut request = self.client.post(&self.upload_url).multipart(form);
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request.send().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Upload failed: {}", error_text);
            return match StageError::from_status(SERVICE, status, &error_text) {
                StageError::Validation(message) => Err(StageError::Upload(message)),
                other => Err(other),
            };
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| StageError::Upload(format!("Malformed upload response: {}", e)))?;
        let url = remote_url(parsed)?;
        tracing::info!("✅ Video published: {} ({})", metadata.title, url);
        Ok(url)
    }
}
