// ComfyUI client - AnimateDiff constellation clips via /prompt, /history and /view
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::StageError;
use crate::types::ArtifactKind;
use crate::utils::probe_duration;
use crate::workflow::artifacts::ArtifactDraft;
use crate::workflow::stages::{RenderPoll, RenderRequest, VideoGenerator};

const SERVICE: &str = "ComfyUI";

const NEGATIVE_PROMPT: &str = "blurry, low quality, human, duplicate, abrupt transition, sudden change, \
discontinuous animation, jerky movement, static image, frozen frame, harsh cuts, \
disconnected elements, scattered random dots, chaotic unconnected lines, text, watermark, signature";

#[derive(Clone)]
pub struct ComfyUiVideoGenerator {
    client: Client,
    base_url: String,
    client_id: String,
    checkpoint: String,
    motion_model: String,
}

#[derive(Deserialize, Debug)]
struct QueueResponse {
    prompt_id: String,
}

#[derive(Deserialize, Debug, Default)]
struct HistoryEntry {
    #[serde(default)]
    status: Option<HistoryStatus>,
    #[serde(default)]
    outputs: HashMap<String, NodeOutput>,
}

#[derive(Deserialize, Debug)]
struct HistoryStatus {
    #[serde(default)]
    status_str: String,
    #[serde(default)]
    completed: bool,
}

#[derive(Deserialize, Debug, Default)]
struct NodeOutput {
    #[serde(default)]
    gifs: Vec<OutputFile>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct OutputFile {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl ComfyUiVideoGenerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            checkpoint: "dreamshaper_8.safetensors".to_string(),
            motion_model: "mm_sd_v15_v2.ckpt".to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    /// Node graph: checkpoint, prompts, latent batch, sampler, decode, AnimateDiff, mp4 combine
    pub fn build_workflow(&self, request: &RenderRequest) -> Value {
        let montage = &request.montage;
        json!({
            "1": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": self.checkpoint }
            },
            "2": {
                "class_type": "ADE_AnimateDiffLoaderGen1",
                "inputs": {
                    "model": ["1", 0],
                    "model_name": self.motion_model,
                    "beta_schedule": "sqrt_linear (AnimateDiff)"
                }
            },
            "3": {
                "class_type": "CLIPTextEncode",
                "inputs": { "clip": ["1", 1], "text": request.prompt }
            },
            "4": {
                "class_type": "CLIPTextEncode",
                "inputs": { "clip": ["1", 1], "text": NEGATIVE_PROMPT }
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": {
                    "width": montage.width,
                    "height": montage.height,
                    "batch_size": montage.render_frames
                }
            },
            "6": {
                "class_type": "KSampler",
                "inputs": {
                    "model": ["2", 0],
                    "positive": ["3", 0],
                    "negative": ["4", 0],
                    "latent_image": ["5", 0],
                    "seed": request.seed,
                    "steps": 25,
                    "cfg": 8.0,
                    "sampler_name": "dpmpp_2m",
                    "scheduler": "karras",
                    "denoise": 1.0
                }
            },
            "7": {
                "class_type": "VAEDecode",
                "inputs": { "samples": ["6", 0], "vae": ["1", 2] }
            },
            "22": {
                "class_type": "VHS_VideoCombine",
                "inputs": {
                    "images": ["7", 0],
                    "frame_rate": montage.fps,
                    "loop_count": 0,
                    "filename_prefix": "astro_montage",
                    "format": "video/h264-mp4",
                    "pingpong": false,
                    "save_output": true
                }
            }
        })
    }

    async fn download(&self, file: &OutputFile, request: &RenderRequest) -> Result<ArtifactDraft, StageError> {
        let response = self
            .client
            .get(self.url("view"))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_deref().unwrap_or("output")),
            ])
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }
        let bytes = response.bytes().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        if bytes.is_empty() {
            return Err(StageError::EmptyResult(format!("{} produced an empty clip", SERVICE)));
        }

        tokio::fs::create_dir_all(&request.out_dir)
            .await
            .map_err(|e| StageError::Transient(format!("Failed to create {}: {}", request.out_dir.display(), e)))?;
        let path = request.out_dir.join("clip.mp4");
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StageError::Transient(format!("Failed to write {}: {}", path.display(), e)))?;

        let mut draft = ArtifactDraft::from_bytes(ArtifactKind::Video, path.display().to_string(), &bytes);
        if let Ok(duration) = probe_duration(&path).await {
            draft = draft.with_duration(duration);
        }
        Ok(draft)
    }
}

fn first_mp4(entry: &HistoryEntry) -> Option<OutputFile> {
    let mut node_ids: Vec<&String> = entry.outputs.keys().collect();
    node_ids.sort();
    node_ids
        .into_iter()
        .flat_map(|id| entry.outputs[id].gifs.iter())
        .find(|f| f.filename.ends_with(".mp4"))
        .cloned()
}

/// `queue_running` entries are `[number, prompt_id, prompt, extra, outputs]`
fn is_running(queue: &Value, job_id: &str) -> bool {
    queue["queue_running"]
        .as_array()
        .map(|running| running.iter().any(|entry| entry[1].as_str() == Some(job_id)))
        .unwrap_or(false)
}

#[async_trait]
impl VideoGenerator for ComfyUiVideoGenerator {
    async fn submit(&self, request: &RenderRequest) -> Result<String, StageError> {
        let payload = json!({ "prompt": self.build_workflow(request), "client_id": self.client_id });
        let response = self
            .client
            .post(self.url("prompt"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }

        let queued: QueueResponse = response.json().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        tracing::info!(prompt_id = %queued.prompt_id, seed = request.seed, "🚀 render queued");
        Ok(queued.prompt_id)
    }

    async fn poll(&self, job_id: &str, request: &RenderRequest) -> Result<RenderPoll, StageError> {
        let response = self
            .client
            .get(self.url(&format!("history/{}", job_id)))
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StageError::from_status(SERVICE, status, &error_text));
        }

        let mut history: HashMap<String, HistoryEntry> =
            response.json().await.map_err(|e| StageError::from_reqwest(SERVICE, e))?;
        let Some(entry) = history.remove(job_id) else {
            return Ok(RenderPoll::Pending);
        };

        if let Some(status) = &entry.status {
            if status.status_str == "error" {
                return Ok(RenderPoll::Failed(format!("{} job {} failed", SERVICE, job_id)));
            }
            if !status.completed {
                return Ok(RenderPoll::Pending);
            }
        }

        match first_mp4(&entry) {
            Some(file) => Ok(RenderPoll::Done(self.download(&file, request).await?)),
            None if entry.outputs.is_empty() => Ok(RenderPoll::Pending),
            None => Ok(RenderPoll::Failed(format!("{} job {} produced no mp4 output", SERVICE, job_id))),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), StageError> {
        // /interrupt stops whatever is executing, so only send it for our own job
        let queue: Value = self
            .client
            .get(self.url("queue"))
            .send()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?
            .json()
            .await
            .map_err(|e| StageError::from_reqwest(SERVICE, e))?;

        if is_running(&queue, job_id) {
            self.client
                .post(self.url("interrupt"))
                .send()
                .await
                .map_err(|e| StageError::from_reqwest(SERVICE, e))?;
            tracing::info!(prompt_id = %job_id, "render interrupted");
        } else {
            self.client
                .post(self.url("queue"))
                .json(&json!({ "delete": [job_id] }))
                .send()
                .await
                .map_err(|e| StageError::from_reqwest(SERVICE, e))?;
            tracing::info!(prompt_id = %job_id, "render dropped from queue");
        }
        Ok(())
    }
}
