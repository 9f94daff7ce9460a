// error.rs - Error taxonomy shared by the workflow engine
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StageId;

/// Failure of a single stage attempt, classified for retry decisions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Transient service error: {0}")]
    Transient(String),
    #[error("Resource exhausted: no {stage} token within {waited_ms}ms")]
    ResourceExhausted { stage: StageId, waited_ms: u64 },
    #[error("Empty result: {0}")]
    EmptyResult(String),
    #[error("Assembly error: {0}")]
    Assembly(String),
    #[error("Upload error: {0}")]
    Upload(String),
    #[error("Cancelled")]
    Cancelled,
}

/// Serializable error class recorded on a StageResult
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientService,
    ResourceExhausted,
    EmptyResult,
    Assembly,
    Upload,
    Cancelled,
}

/// Error snapshot attached to a failed stage or a failed combined assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    /// Timeouts, connection failures, upstream overload and pool exhaustion
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_) | StageError::ResourceExhausted { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Transient(_) => ErrorKind::TransientService,
            StageError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            StageError::EmptyResult(_) => ErrorKind::EmptyResult,
            StageError::Assembly(_) => ErrorKind::Assembly,
            StageError::Upload(_) => ErrorKind::Upload,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn to_failure(&self) -> StageFailure {
        StageFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Classify an HTTP transport error. Bad requests (malformed URL, redirect
    /// loops, undecodable payloads) are permanent; transport failures are retried.
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            StageError::Transient(format!("{} connection error: {}", service, err))
        } else if err.is_decode() {
            StageError::Validation(format!("{} returned a malformed payload: {}", service, err))
        } else if err.is_builder() || err.is_redirect() {
            StageError::Validation(format!("{} request is invalid: {}", service, err))
        } else {
            StageError::Transient(format!("{} request error: {}", service, err))
        }
    }

    /// Classify a non-success HTTP status: 5xx and 429 are transient
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{} API error ({}): {}", service, status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            StageError::Transient(message)
        } else {
            StageError::Validation(message)
        }
    }
}

/// ResourceScheduler admission failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Timed out after {waited_ms}ms waiting for a {stage} token")]
    TimeoutExceeded { stage: StageId, waited_ms: u64 },
    #[error("No token pool configured for stage {0}")]
    UnknownStage(StageId),
    #[error("Token pool for stage {0} is closed")]
    Closed(StageId),
}

impl From<SchedulerError> for StageError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::TimeoutExceeded { stage, waited_ms } => {
                StageError::ResourceExhausted { stage, waited_ms }
            }
            other => StageError::Validation(other.to_string()),
        }
    }
}

/// SyncPlanner failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Transcript contains no words")]
    EmptyTranscript,
    #[error("Invalid duration: audio {audio:.2}s, video {video:.2}s (both must be > 0)")]
    InvalidDuration { audio: f64, video: f64 },
}

impl From<SyncError> for StageError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::EmptyTranscript => StageError::EmptyResult(err.to_string()),
            SyncError::InvalidDuration { .. } => StageError::Validation(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact slot {slot} of {owner} is already written")]
    SlotTaken { owner: String, slot: String },
    #[error("Failed to read artifact content at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
