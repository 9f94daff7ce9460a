// ArtifactStore - write-once registry of intermediate and final outputs
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use crate::error::ArtifactError;
use crate::types::{new_id, Artifact, ArtifactId, ArtifactKind, StageId};

/// Unregistered artifact as returned by a stage executor
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub kind: ArtifactKind,
    pub location: String,
    pub size_bytes: u64,
    pub duration_seconds: Option<f64>,
    pub checksum: String,
    pub inline: Option<String>,
}

impl ArtifactDraft {
    /// Textual payload kept in the store itself
    pub fn inline(kind: ArtifactKind, body: String) -> Self {
        Self {
            kind,
            location: format!("inline:{}", kind.as_str()),
            size_bytes: body.len() as u64,
            duration_seconds: None,
            checksum: checksum_bytes(body.as_bytes()),
            inline: Some(body),
        }
    }

    pub fn from_bytes(kind: ArtifactKind, location: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            kind,
            location: location.into(),
            size_bytes: bytes.len() as u64,
            duration_seconds: None,
            checksum: checksum_bytes(bytes),
            inline: None,
        }
    }

    /// Hash a file on disk in chunks
    pub async fn from_file(kind: ArtifactKind, path: &Path) -> Result<Self, ArtifactError> {
        let io_err = |source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            size += n as u64;
            hasher.update(&buf[..n]);
        }
        Ok(Self {
            kind,
            location: path.display().to_string(),
            size_bytes: size,
            duration_seconds: None,
            checksum: hex::encode(hasher.finalize()),
            inline: None,
        })
    }

    /// Remote reference whose bytes are not available locally
    pub fn reference(kind: ArtifactKind, location: impl Into<String>, size_bytes: u64) -> Self {
        let location = location.into();
        Self {
            kind,
            checksum: checksum_bytes(location.as_bytes()),
            location,
            size_bytes,
            duration_seconds: None,
            inline: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Artifacts indexed by id. Each (owner, stage) slot has a single writer and is
/// written at most once; readers only see artifacts after registration.
pub struct ArtifactStore {
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
    slots: RwLock<HashSet<(String, StageId)>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self {
            artifacts: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashSet::new()),
        }
    }

    /// Register a draft under the owner's slot for `stage`
    pub async fn put(&self, owner: &str, stage: StageId, draft: ArtifactDraft) -> Result<Artifact, ArtifactError> {
        {
            let mut slots = self.slots.write().await;
            if !slots.insert((owner.to_string(), stage)) {
                return Err(ArtifactError::SlotTaken {
                    owner: owner.to_string(),
                    slot: stage.to_string(),
                });
            }
        }

        let artifact = Artifact {
            id: new_id(),
            owner: owner.to_string(),
            stage,
            kind: draft.kind,
            location: draft.location,
            size_bytes: draft.size_bytes,
            duration_seconds: draft.duration_seconds,
            checksum: draft.checksum,
            inline: draft.inline,
            created_at: Utc::now(),
        };

        self.artifacts.write().await.insert(artifact.id.clone(), artifact.clone());
        tracing::debug!(
            artifact_id = %artifact.id,
            owner = %owner,
            stage = %stage,
            kind = ?artifact.kind,
            size_bytes = artifact.size_bytes,
            "artifact registered"
        );
        Ok(artifact)
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        self.artifacts.read().await.get(id).cloned()
    }

    pub async fn list_for(&self, owner: &str) -> Vec<Artifact> {
        let mut list: Vec<Artifact> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.stage);
        list
    }

    /// Drop metadata for an evicted run or batch; files are left alone
    pub async fn remove_owner(&self, owner: &str) -> usize {
        let mut artifacts = self.artifacts.write().await;
        let before = artifacts.len();
        artifacts.retain(|_, a| a.owner != owner);
        self.slots.write().await.retain(|(o, _)| o != owner);
        before - artifacts.len()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}
