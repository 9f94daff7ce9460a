// types.rs - Data model shared by the workflow engine, the HTTP surface and collaborators
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{StageError, StageFailure};
use crate::zodiac::Sign;

pub type RunId = String;
pub type BatchId = String;
pub type ArtifactId = String;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// CONTENT & MONTAGE
// ============================================================================

/// One sign+date+locale request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub sign: Sign,
    pub date: NaiveDate,
    pub locale: String,
}

pub const DEFAULT_LOCALE: &str = "fr";

impl ContentUnit {
    pub fn new(sign: Sign, date: NaiveDate, locale: impl Into<String>) -> Self {
        Self {
            sign,
            date,
            locale: locale.into(),
        }
    }

    /// Build from raw request fields, rejecting unknown signs and malformed dates
    pub fn parse(sign: &str, date: &str, locale: Option<&str>) -> Result<Self, StageError> {
        let sign: Sign = sign.parse().map_err(StageError::Validation)?;
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
            StageError::Validation(format!("Invalid date '{}' (expected YYYY-MM-DD): {}", date, e))
        })?;
        let locale = locale
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string());
        Ok(Self::new(sign, date, locale))
    }

    /// Canonical content-unit order: sign order, then date, then locale
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.sign
            .cmp(&other.sign)
            .then_with(|| self.date.cmp(&other.date))
            .then_with(|| self.locale.cmp(&other.locale))
    }
}

impl fmt::Display for ContentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[{}]", self.sign, self.date, self.locale)
    }
}

/// Target publishing platform; each one carries a render preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformProfile {
    YoutubeShort,
    Tiktok,
    InstagramReel,
    Square,
    Test,
}

/// Output geometry and duration bounds. Supplied by the caller, immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MontageSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub profile: PlatformProfile,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    /// Frames requested from the renderer per clip
    #[serde(default = "default_render_frames")]
    pub render_frames: u32,
}

fn default_render_frames() -> u32 {
    16
}

impl MontageSpec {
    pub fn for_profile(profile: PlatformProfile) -> Self {
        let (width, height) = match profile {
            PlatformProfile::YoutubeShort | PlatformProfile::Tiktok | PlatformProfile::InstagramReel => (1080, 1920),
            PlatformProfile::Square => (1080, 1080),
            PlatformProfile::Test => (512, 960),
        };
        Self {
            width,
            height,
            fps: 8,
            profile,
            min_duration_seconds: 0.0,
            max_duration_seconds: 180.0,
            render_frames: default_render_frames(),
        }
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.width == 0 || self.height == 0 {
            return Err(StageError::Validation(format!(
                "Montage dimensions must be non-zero (got {}x{})",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.render_frames == 0 {
            return Err(StageError::Validation("Montage fps and render_frames must be non-zero".to_string()));
        }
        if self.min_duration_seconds < 0.0 || self.max_duration_seconds <= 0.0 {
            return Err(StageError::Validation("Montage duration bounds must be positive".to_string()));
        }
        if self.min_duration_seconds > self.max_duration_seconds {
            return Err(StageError::Validation(format!(
                "min_duration_seconds ({}) exceeds max_duration_seconds ({})",
                self.min_duration_seconds, self.max_duration_seconds
            )));
        }
        Ok(())
    }

    /// Length of one rendered clip
    pub fn clip_duration_seconds(&self) -> f64 {
        self.render_frames as f64 / self.fps as f64
    }
}

impl Default for MontageSpec {
    fn default() -> Self {
        Self::for_profile(PlatformProfile::YoutubeShort)
    }
}

// ============================================================================
// RUN OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Unlisted,
    #[default]
    Private,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceOptions {
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub stability: Option<f64>,
    #[serde(default)]
    pub similarity_boost: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub privacy: Privacy,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-request knobs. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Attempts per mandatory stage (defaults to the configured maximum)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_true")]
    pub add_music: bool,
    /// Publishing is skipped when absent
    #[serde(default)]
    pub publish: Option<PublishOptions>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub voice: VoiceOptions,
    #[serde(default)]
    pub cue_max_chars: Option<usize>,
    #[serde(default)]
    pub cue_max_seconds: Option<f64>,
    /// Overall deadline; the run (or batch) is cancelled when it expires
    #[serde(default)]
    pub deadline_seconds: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_attempts: None,
            add_music: true,
            publish: None,
            seed: None,
            voice: VoiceOptions::default(),
            cue_max_chars: None,
            cue_max_seconds: None,
            deadline_seconds: None,
        }
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Audio,
    Video,
    Transcript,
    FinalVideo,
    CombinedVideo,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Video => "video",
            ArtifactKind::Transcript => "transcript",
            ArtifactKind::FinalVideo => "final_video",
            ArtifactKind::CombinedVideo => "combined_video",
        }
    }
}

/// Immutable reference to a produced output. A re-run produces a new Artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Run id (or batch id for the combined video) that wrote this artifact
    pub owner: String,
    pub stage: StageId,
    pub kind: ArtifactKind,
    pub location: String,
    pub size_bytes: u64,
    pub duration_seconds: Option<f64>,
    pub checksum: String,
    /// Small textual payloads (generated text, transcript JSON) kept inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// STAGES & RUNS
// ============================================================================

/// Declared stage sequence of a pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    TextGeneration,
    SpeechSynthesis,
    VideoGeneration,
    Transcription,
    SyncPlan,
    MusicMix,
    Assembly,
    Publish,
}

impl StageId {
    pub const PIPELINE: [StageId; 8] = [
        StageId::TextGeneration,
        StageId::SpeechSynthesis,
        StageId::VideoGeneration,
        StageId::Transcription,
        StageId::SyncPlan,
        StageId::MusicMix,
        StageId::Assembly,
        StageId::Publish,
    ];

    pub fn is_optional(&self) -> bool {
        matches!(self, StageId::MusicMix | StageId::Publish)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::TextGeneration => "text_generation",
            StageId::SpeechSynthesis => "speech_synthesis",
            StageId::VideoGeneration => "video_generation",
            StageId::Transcription => "transcription",
            StageId::SyncPlan => "sync_plan",
            StageId::MusicMix => "music_mix",
            StageId::Assembly => "assembly",
            StageId::Publish => "publish",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    pub artifact: Option<ArtifactId>,
    pub error: Option<StageFailure>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn pending(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            artifact: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PartiallyFailed,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::PartiallyFailed | RunStatus::Completed | RunStatus::Failed)
    }
}

/// One execution of the full stage sequence for one ContentUnit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub batch_id: Option<BatchId>,
    pub unit: ContentUnit,
    pub montage: MontageSpec,
    pub options: RunOptions,
    pub stages: Vec<StageResult>,
    pub status: RunStatus,
    pub sync_plan: Option<SyncPlan>,
    pub remote_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(unit: ContentUnit, montage: MontageSpec, options: RunOptions, batch_id: Option<BatchId>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            batch_id,
            unit,
            montage,
            options,
            stages: StageId::PIPELINE.iter().map(|s| StageResult::pending(*s)).collect(),
            status: RunStatus::Pending,
            sync_plan: None,
            remote_url: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn stage(&self, stage: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn stage_mut(&mut self, stage: StageId) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.stage == stage)
    }

    /// Final video artifact, present only when Assembly succeeded
    pub fn final_video(&self) -> Option<&ArtifactId> {
        self.stage(StageId::Assembly)
            .filter(|s| s.status == StageStatus::Succeeded)
            .and_then(|s| s.artifact.as_ref())
    }

    /// First failed stage, if any
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Finished,
}

/// Aggregate counts over the terminal statuses of a batch's runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub partially_failed: usize,
    pub failed: usize,
    /// completed + partially_failed
    pub succeeded: usize,
}

impl BatchCounts {
    pub fn tally<'a>(total: usize, statuses: impl IntoIterator<Item = &'a RunStatus>) -> Self {
        let mut counts = BatchCounts {
            total,
            ..Default::default()
        };
        for status in statuses {
            match status {
                RunStatus::Completed => counts.completed += 1,
                RunStatus::PartiallyFailed => counts.partially_failed += 1,
                RunStatus::Failed => counts.failed += 1,
                RunStatus::Pending | RunStatus::Running => counts.in_flight += 1,
            }
        }
        counts.succeeded = counts.completed + counts.partially_failed;
        counts
    }
}

/// A set of PipelineRuns dispatched together plus their combined deliverable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: BatchId,
    pub runs: Vec<RunId>,
    pub montage: MontageSpec,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub combined: Option<ArtifactId>,
    pub combined_error: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchRun {
    pub fn new(id: BatchId, runs: Vec<RunId>, montage: MontageSpec) -> Self {
        let total = runs.len();
        Self {
            id,
            runs,
            montage,
            status: BatchStatus::Running,
            counts: BatchCounts {
                total,
                in_flight: total,
                ..Default::default()
            },
            combined: None,
            combined_error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

// ============================================================================
// TRANSCRIPTION & SYNC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub words: Vec<WordTiming>,
    pub text: String,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// How the source clip is fitted to the voice track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationDirective {
    /// Video shorter than audio: loop the clip at its boundary
    Loop,
    /// Video longer than audio: cut the clip at the target duration
    Trim,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub cues: Vec<SubtitleCue>,
    pub directive: DurationDirective,
    /// Duration of the synchronized output (the voice track, unless clamped)
    pub target_duration: f64,
    pub source_video_duration: f64,
    /// Clip repetitions needed to cover the target when looping
    pub loop_count: u32,
    /// True when montage bounds shortened or extended the target
    pub clamped: bool,
}
