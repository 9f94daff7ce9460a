// Stage executors - one capability interface per stage type
//
// The runner only sees `StageExecutor`; each executor wraps a vendor-neutral
// collaborator trait so concrete services are swapped at wiring time.
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::artifacts::ArtifactDraft;
use super::sync_planner::{CueConfig, SyncPlanner};
use crate::error::StageError;
use crate::types::{
    Artifact, ArtifactKind, ContentUnit, MontageSpec, PipelineRun, Privacy, RunId, RunOptions, StageId, SyncPlan,
    TranscriptionResult, VoiceOptions,
};

// ============================================================================
// COLLABORATOR CONTRACTS
// ============================================================================

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, unit: &ContentUnit) -> Result<String, StageError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returned draft carries the spoken duration in `duration_seconds`
    async fn synthesize(&self, text: &str, voice: &VoiceOptions, out_dir: &Path) -> Result<ArtifactDraft, StageError>;
}

/// One clip render submitted to a queue-based renderer
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub prompt: String,
    pub seed: u64,
    pub montage: MontageSpec,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderPoll {
    Pending,
    Done(ArtifactDraft),
    Failed(String),
}

#[async_trait]
pub trait VideoGenerator: Send + Sync {
    async fn submit(&self, request: &RenderRequest) -> Result<String, StageError>;
    async fn poll(&self, job_id: &str, request: &RenderRequest) -> Result<RenderPoll, StageError>;
    async fn cancel(&self, job_id: &str) -> Result<(), StageError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Artifact) -> Result<TranscriptionResult, StageError>;
}

/// Everything the assembler needs to mux one unit's final video
#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    pub unit: ContentUnit,
    pub video: Artifact,
    pub audio: Artifact,
    pub plan: SyncPlan,
    pub music: Option<Artifact>,
    pub montage: MontageSpec,
    pub output: PathBuf,
}

#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(&self, request: &AssemblyRequest) -> Result<ArtifactDraft, StageError>;
    /// Plain concatenation of finished videos, in the given order
    async fn concatenate(&self, parts: &[Artifact], montage: &MontageSpec, output: &Path) -> Result<ArtifactDraft, StageError>;
}

#[async_trait]
pub trait MusicLibrary: Send + Sync {
    async fn select(&self, unit: &ContentUnit) -> Result<Option<PathBuf>, StageError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the remote URL of the uploaded video
    async fn upload(&self, video: &Artifact, metadata: &PublishMetadata, privacy: Privacy) -> Result<String, StageError>;
}

/// Concrete collaborator set handed to `StagePlan::standard`
#[derive(Clone)]
pub struct Collaborators {
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub video: Arc<dyn VideoGenerator>,
    pub transcriber: Arc<dyn Transcriber>,
    pub assembler: Arc<dyn Assembler>,
    pub music: Arc<dyn MusicLibrary>,
    pub publisher: Arc<dyn Publisher>,
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// Explicit per-run state threaded through every stage call
pub struct RunContext {
    pub run_id: RunId,
    pub unit: ContentUnit,
    pub montage: MontageSpec,
    pub options: RunOptions,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
    pub text: Option<String>,
    /// Artifacts of Succeeded stages only
    pub artifacts: HashMap<StageId, Artifact>,
    pub transcription: Option<TranscriptionResult>,
    pub sync_plan: Option<SyncPlan>,
}

impl RunContext {
    pub fn new(run: &PipelineRun, work_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            run_id: run.id.clone(),
            unit: run.unit.clone(),
            montage: run.montage.clone(),
            options: run.options.clone(),
            work_dir,
            cancel,
            text: None,
            artifacts: HashMap::new(),
            transcription: None,
            sync_plan: None,
        }
    }

    /// Output of an earlier stage; missing means the runner broke ordering
    pub fn upstream(&self, stage: StageId) -> Result<&Artifact, StageError> {
        self.artifacts
            .get(&stage)
            .ok_or_else(|| StageError::Validation(format!("No {} artifact available for run {}", stage, self.run_id)))
    }
}

/// What a stage produced on success
#[derive(Debug, Clone)]
pub enum StageOutput {
    Text(String),
    Artifact(ArtifactDraft),
    Transcript(TranscriptionResult),
    Plan(SyncPlan),
    Published { url: String },
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> StageId;

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError>;

    /// Abandon any external work still attached to `run_id`
    async fn cancel(&self, _run_id: &str) {}
}

// ============================================================================
// STAGE ADAPTERS
// ============================================================================

pub struct TextStage {
    generator: Arc<dyn TextGenerator>,
}

#[async_trait]
impl StageExecutor for TextStage {
    fn stage(&self) -> StageId {
        StageId::TextGeneration
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let text = self.generator.generate(&ctx.unit).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(StageError::EmptyResult(format!("Text generator returned nothing for {}", ctx.unit)));
        }
        Ok(StageOutput::Text(text.to_string()))
    }
}

pub struct SpeechStage {
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

#[async_trait]
impl StageExecutor for SpeechStage {
    fn stage(&self) -> StageId {
        StageId::SpeechSynthesis
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let text = ctx
            .text
            .as_deref()
            .ok_or_else(|| StageError::Validation("Speech synthesis needs generated text".to_string()))?;
        let draft = self.synthesizer.synthesize(text, &ctx.options.voice, &ctx.work_dir).await?;
        match draft.duration_seconds {
            Some(d) if d > 0.0 => Ok(StageOutput::Artifact(draft)),
            _ => Err(StageError::EmptyResult("Synthesized audio has no duration".to_string())),
        }
    }
}

/// Render queue polling bounds
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up on a job that is still pending after this long
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(600),
        }
    }
}

pub struct RenderStage {
    generator: Arc<dyn VideoGenerator>,
    poll: PollConfig,
    /// Submitted job per run, removed once the job resolves
    in_flight: Mutex<HashMap<RunId, String>>,
}

impl RenderStage {
    pub fn new(generator: Arc<dyn VideoGenerator>, poll: PollConfig) -> Self {
        Self {
            generator,
            poll,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn wait_for_job(&self, job_id: &str, request: &RenderRequest, cancel: &CancellationToken) -> Result<ArtifactDraft, StageError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.poll.initial_interval)
            .with_max_interval(self.poll.max_interval)
            .with_multiplier(1.5)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(Some(self.poll.max_wait))
            .build();

        loop {
            match self.generator.poll(job_id, request).await? {
                RenderPoll::Done(draft) => return Ok(draft),
                RenderPoll::Failed(reason) => {
                    return Err(StageError::Transient(format!("Render job {} failed: {}", job_id, reason)));
                }
                RenderPoll::Pending => {}
            }

            let Some(delay) = backoff.next_backoff() else {
                return Err(StageError::Transient(format!(
                    "Render job {} still pending after {:?}",
                    job_id, self.poll.max_wait
                )));
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Visual prompt for one content unit
pub fn render_prompt(unit: &ContentUnit) -> String {
    format!(
        "cinematic vertical shot, {} zodiac sign {} constellation glowing in a deep night sky, \
         astrological symbols, soft nebula light, slow camera drift, highly detailed",
        unit.sign.display_name(),
        unit.sign.glyph()
    )
}

#[async_trait]
impl StageExecutor for RenderStage {
    fn stage(&self) -> StageId {
        StageId::VideoGeneration
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let request = RenderRequest {
            prompt: render_prompt(&ctx.unit),
            seed: ctx.options.seed.unwrap_or_else(rand::random),
            montage: ctx.montage.clone(),
            out_dir: ctx.work_dir.clone(),
        };

        let job_id = self.generator.submit(&request).await?;
        tracing::info!(run_id = %ctx.run_id, job_id = %job_id, seed = request.seed, "🎬 render job submitted");
        self.in_flight.lock().await.insert(ctx.run_id.clone(), job_id.clone());

        let result = self.wait_for_job(&job_id, &request, &ctx.cancel).await;
        let still_tracked = self.in_flight.lock().await.remove(&ctx.run_id).is_some();
        if result.is_err() && still_tracked {
            if let Err(e) = self.generator.cancel(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "failed to cancel render job");
            }
        }

        let draft = result?;
        let duration = draft
            .duration_seconds
            .unwrap_or_else(|| ctx.montage.clip_duration_seconds());
        Ok(StageOutput::Artifact(draft.with_duration(duration)))
    }

    async fn cancel(&self, run_id: &str) {
        let job = self.in_flight.lock().await.remove(run_id);
        if let Some(job_id) = job {
            tracing::info!(run_id = %run_id, job_id = %job_id, "cancelling abandoned render job");
            if let Err(e) = self.generator.cancel(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "failed to cancel render job");
            }
        }
    }
}

pub struct TranscriptionStage {
    transcriber: Arc<dyn Transcriber>,
}

#[async_trait]
impl StageExecutor for TranscriptionStage {
    fn stage(&self) -> StageId {
        StageId::Transcription
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let audio = ctx.upstream(StageId::SpeechSynthesis)?;
        let mut result = self.transcriber.transcribe(audio).await?;
        // Transcribers may omit the total; the synthesized track knows it
        if !(result.duration > 0.0) {
            result.duration = audio.duration_seconds.unwrap_or(0.0);
        }
        Ok(StageOutput::Transcript(result))
    }
}

pub struct SyncStage {
    cues: CueConfig,
}

impl SyncStage {
    fn cue_config(&self, options: &RunOptions) -> CueConfig {
        CueConfig {
            max_chars: options.cue_max_chars.unwrap_or(self.cues.max_chars),
            max_duration: options.cue_max_seconds.unwrap_or(self.cues.max_duration),
            break_on_sentence: self.cues.break_on_sentence,
        }
    }
}

#[async_trait]
impl StageExecutor for SyncStage {
    fn stage(&self) -> StageId {
        StageId::SyncPlan
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let transcription = ctx
            .transcription
            .as_ref()
            .ok_or_else(|| StageError::Validation("Sync planning needs a transcription".to_string()))?;
        let video = ctx.upstream(StageId::VideoGeneration)?;

        let plan = SyncPlanner::new(self.cue_config(&ctx.options))
            .align(transcription, video)?
            .clamp_to(&ctx.montage);
        tracing::debug!(
            run_id = %ctx.run_id,
            cues = plan.cues.len(),
            directive = ?plan.directive,
            target = plan.target_duration,
            "sync plan built"
        );
        Ok(StageOutput::Plan(plan))
    }
}

pub struct MusicStage {
    library: Arc<dyn MusicLibrary>,
}

#[async_trait]
impl StageExecutor for MusicStage {
    fn stage(&self) -> StageId {
        StageId::MusicMix
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let track = self
            .library
            .select(&ctx.unit)
            .await?
            .ok_or_else(|| StageError::EmptyResult(format!("No music track for {}", ctx.unit)))?;
        let draft = ArtifactDraft::from_file(ArtifactKind::Audio, &track)
            .await
            .map_err(|e| StageError::Validation(e.to_string()))?;
        Ok(StageOutput::Artifact(draft))
    }
}

pub struct AssemblyStage {
    assembler: Arc<dyn Assembler>,
}

#[async_trait]
impl StageExecutor for AssemblyStage {
    fn stage(&self) -> StageId {
        StageId::Assembly
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let plan = ctx
            .sync_plan
            .clone()
            .ok_or_else(|| StageError::Validation("Assembly needs a sync plan".to_string()))?;
        let request = AssemblyRequest {
            unit: ctx.unit.clone(),
            video: ctx.upstream(StageId::VideoGeneration)?.clone(),
            audio: ctx.upstream(StageId::SpeechSynthesis)?.clone(),
            plan,
            music: ctx.artifacts.get(&StageId::MusicMix).cloned(),
            montage: ctx.montage.clone(),
            output: ctx.work_dir.join(format!("{}_{}.mp4", ctx.unit.sign, ctx.unit.date)),
        };

        let mut draft = self.assembler.assemble(&request).await?;
        draft.kind = ArtifactKind::FinalVideo;
        if draft.duration_seconds.is_none() {
            draft.duration_seconds = Some(request.plan.target_duration);
        }
        Ok(StageOutput::Artifact(draft))
    }
}

pub struct PublishStage {
    publisher: Arc<dyn Publisher>,
}

pub fn publish_metadata(unit: &ContentUnit, options: &RunOptions) -> PublishMetadata {
    let publish = options.publish.clone().unwrap_or_default();
    let title = publish
        .title
        .unwrap_or_else(|| format!("Horoscope {} {} du {}", unit.sign.glyph(), unit.sign.display_name(), unit.date.format("%d/%m/%Y")));
    let description = publish
        .description
        .unwrap_or_else(|| format!("Votre horoscope {} pour le {}.", unit.sign.display_name(), unit.date));
    let mut tags = publish.tags;
    if tags.is_empty() {
        tags = vec!["horoscope".to_string(), "astrologie".to_string(), unit.sign.as_str().to_string()];
    }
    PublishMetadata { title, description, tags }
}

#[async_trait]
impl StageExecutor for PublishStage {
    fn stage(&self) -> StageId {
        StageId::Publish
    }

    async fn invoke(&self, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let video = ctx.upstream(StageId::Assembly)?;
        let privacy = ctx.options.publish.as_ref().map(|p| p.privacy).unwrap_or_default();
        let url = self
            .publisher
            .upload(video, &publish_metadata(&ctx.unit, &ctx.options), privacy)
            .await?;
        Ok(StageOutput::Published { url })
    }
}

// ============================================================================
// STAGE PLAN
// ============================================================================

/// Executors for the fixed stage sequence, one per `StageId::PIPELINE` entry
#[derive(Clone)]
pub struct StagePlan {
    executors: Vec<Arc<dyn StageExecutor>>,
}

impl StagePlan {
    /// Executors must cover the declared sequence exactly, in order
    pub fn new(executors: Vec<Arc<dyn StageExecutor>>) -> Result<Self, StageError> {
        let declared: Vec<StageId> = executors.iter().map(|e| e.stage()).collect();
        if declared != StageId::PIPELINE {
            return Err(StageError::Validation(format!(
                "Stage plan {:?} does not match the pipeline order {:?}",
                declared,
                StageId::PIPELINE
            )));
        }
        Ok(Self { executors })
    }

    pub fn standard(collaborators: Collaborators, poll: PollConfig, cues: CueConfig) -> Self {
        Self {
            executors: vec![
                Arc::new(TextStage { generator: collaborators.text }),
                Arc::new(SpeechStage { synthesizer: collaborators.speech }),
                Arc::new(RenderStage::new(collaborators.video, poll)),
                Arc::new(TranscriptionStage { transcriber: collaborators.transcriber }),
                Arc::new(SyncStage { cues }),
                Arc::new(MusicStage { library: collaborators.music }),
                Arc::new(AssemblyStage { assembler: collaborators.assembler }),
                Arc::new(PublishStage { publisher: collaborators.publisher }),
            ],
        }
    }

    pub fn get(&self, stage: StageId) -> Option<&Arc<dyn StageExecutor>> {
        self.executors.iter().find(|e| e.stage() == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishOptions;
    use crate::zodiac::Sign;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit() -> ContentUnit {
        ContentUnit::new(Sign::Leo, NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(), "fr")
    }

    fn context() -> RunContext {
        let run = PipelineRun::new(unit(), MontageSpec::default(), RunOptions::default(), None);
        RunContext::new(&run, std::env::temp_dir(), CancellationToken::new())
    }

    /// Stays pending for `pending_polls` polls, then finishes
    struct SlowRenderer {
        pending_polls: usize,
        polls: AtomicUsize,
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl VideoGenerator for SlowRenderer {
        async fn submit(&self, _request: &RenderRequest) -> Result<String, StageError> {
            Ok("job-1".to_string())
        }

        async fn poll(&self, _job_id: &str, _request: &RenderRequest) -> Result<RenderPoll, StageError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                Ok(RenderPoll::Pending)
            } else {
                Ok(RenderPoll::Done(ArtifactDraft::reference(ArtifactKind::Video, "/tmp/clip.mp4", 10)))
            }
        }

        async fn cancel(&self, _job_id: &str) -> Result<(), StageError> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_wait: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_render_polls_until_done() {
        let renderer = Arc::new(SlowRenderer {
            pending_polls: 3,
            polls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        });
        let stage = RenderStage::new(renderer.clone(), fast_poll());

        let output = stage.invoke(&context()).await.unwrap();
        let StageOutput::Artifact(draft) = output else {
            panic!("expected an artifact");
        };
        assert_eq!(renderer.polls.load(Ordering::SeqCst), 4);
        // 16 frames at 8 fps
        assert_eq!(draft.duration_seconds, Some(2.0));
        assert_eq!(renderer.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_render_cancellation_cancels_queue_job() {
        let renderer = Arc::new(SlowRenderer {
            pending_polls: usize::MAX,
            polls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        });
        let stage = RenderStage::new(renderer.clone(), fast_poll());
        let ctx = context();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = stage.invoke(&ctx).await;
        assert_eq!(result.unwrap_err(), StageError::Cancelled);
        assert_eq!(renderer.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_render_gives_up_after_max_wait() {
        let renderer = Arc::new(SlowRenderer {
            pending_polls: usize::MAX,
            polls: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        });
        let poll = PollConfig {
            max_wait: Duration::from_millis(15),
            ..fast_poll()
        };
        let stage = RenderStage::new(renderer.clone(), poll);

        let err = stage.invoke(&context()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(renderer.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_stage_applies_per_run_overrides() {
        let stage = SyncStage { cues: CueConfig::default() };
        let options = RunOptions {
            cue_max_chars: Some(20),
            ..Default::default()
        };
        let cues = stage.cue_config(&options);
        assert_eq!(cues.max_chars, 20);
        assert_eq!(cues.max_duration, 4.0);
    }

    #[test]
    fn test_publish_metadata_defaults() {
        let options = RunOptions {
            publish: Some(PublishOptions::default()),
            ..Default::default()
        };
        let metadata = publish_metadata(&unit(), &options);
        assert!(metadata.title.contains("Lion"));
        assert!(metadata.title.contains("19/10/2026"));
        assert!(metadata.tags.contains(&"leo".to_string()));
    }

    #[test]
    fn test_stage_plan_requires_pipeline_order() {
        let text: Arc<dyn StageExecutor> = Arc::new(SyncStage { cues: CueConfig::default() });
        let err = StagePlan::new(vec![text]).err().unwrap();
        assert!(matches!(err, StageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_upstream_artifact_is_a_validation_error() {
        let ctx = context();
        assert!(matches!(ctx.upstream(StageId::VideoGeneration), Err(StageError::Validation(_))));
    }
}
