// PipelineRunner - executes the fixed stage sequence for one content unit
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::{ArtifactDraft, ArtifactStore};
use super::scheduler::ResourceScheduler;
use super::stages::{RunContext, StageExecutor, StageOutput, StagePlan};
use super::state::{EventKind, RunRegistry};
use crate::error::StageError;
use crate::types::{
    ArtifactId, ArtifactKind, BatchId, ContentUnit, MontageSpec, PipelineRun, RunId, RunOptions, RunStatus, StageId,
    StageStatus,
};

/// Exponential retry delays: base, 2x base, 4x base ... capped
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.cap)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Attempts per mandatory stage unless the run overrides it
    pub max_attempts: u32,
    pub optional_attempts: u32,
    pub retry: RetryPolicy,
    /// Deadline for one collaborator invocation
    pub stage_timeout: Duration,
    /// Deadline for one token acquisition
    pub acquire_timeout: Duration,
    /// Each run writes under `<output_dir>/<run_id>`
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            optional_attempts: 3,
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(900),
            output_dir: PathBuf::from("final_montage"),
        }
    }
}

pub struct PipelineRunner {
    plan: StagePlan,
    scheduler: Arc<ResourceScheduler>,
    store: Arc<ArtifactStore>,
    registry: Arc<RunRegistry>,
    config: RunnerConfig,
}

/// Why the stage loop stopped early
enum Halt {
    MandatoryFailure,
    Cancelled,
}

impl PipelineRunner {
    pub fn new(
        plan: StagePlan,
        scheduler: Arc<ResourceScheduler>,
        store: Arc<ArtifactStore>,
        registry: Arc<RunRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            plan,
            scheduler,
            store,
            registry,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one unit to a terminal state
    pub async fn run(&self, unit: ContentUnit, montage: MontageSpec, options: RunOptions) -> Result<PipelineRun, StageError> {
        let (run, cancel) = self.prepare(unit, montage, options, None, CancellationToken::new()).await?;
        Ok(self.execute(run, cancel).await)
    }

    /// Register a run and execute it in the background
    pub async fn start(self: &Arc<Self>, unit: ContentUnit, montage: MontageSpec, options: RunOptions) -> Result<RunId, StageError> {
        let (run, cancel) = self.prepare(unit, montage, options, None, CancellationToken::new()).await?;
        let run_id = run.id.clone();
        let runner = self.clone();
        tokio::spawn(async move {
            let registry = runner.registry.clone();
            let run_id = run.id.clone();
            let fallback = run.clone();
            let joined = tokio::spawn(async move { runner.execute(run, cancel).await }).await;
            if let Err(e) = joined {
                error!(run_id = %run_id, error = %e, "pipeline task aborted");
                let mut failed = registry.get_run(&run_id).await.unwrap_or(fallback);
                failed.status = RunStatus::Failed;
                failed.finished_at = Some(Utc::now());
                registry.update_run(&failed).await;
            }
        });
        Ok(run_id)
    }

    /// Validate the request and register a Pending run. `parent` is the batch
    /// token when the run belongs to a batch.
    pub async fn prepare(
        &self,
        unit: ContentUnit,
        montage: MontageSpec,
        options: RunOptions,
        batch_id: Option<BatchId>,
        parent: CancellationToken,
    ) -> Result<(PipelineRun, CancellationToken), StageError> {
        montage.validate()?;
        if options.max_attempts == Some(0) {
            return Err(StageError::Validation("max_attempts must be at least 1".to_string()));
        }

        let run = PipelineRun::new(unit, montage, options, batch_id);
        let cancel = parent.child_token();
        self.registry.insert_run(run.clone(), cancel.clone()).await;
        Ok((run, cancel))
    }

    /// Drive a prepared run through every stage. Always returns a terminal run.
    pub async fn execute(&self, mut run: PipelineRun, cancel: CancellationToken) -> PipelineRun {
        let deadline_watch = CancellationToken::new();
        if let Some(secs) = run.options.deadline_seconds {
            spawn_deadline(run.id.clone(), Duration::from_secs(secs), cancel.clone(), deadline_watch.clone());
        }

        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        self.registry.update_run(&run).await;
        self.registry.emit(EventKind::RunStarted {
            run_id: run.id.clone(),
            batch_id: run.batch_id.clone(),
            unit: run.unit.to_string(),
        });
        info!(run_id = %run.id, unit = %run.unit, "🚀 pipeline run started");

        let work_dir = self.config.output_dir.join(&run.id);
        let mut ctx = RunContext::new(&run, work_dir, cancel);
        let mut halt: Option<Halt> = None;
        let mut optional_failed = false;

        for stage in StageId::PIPELINE {
            if halt.is_some() {
                self.finish_stage(&mut run, stage, StageStatus::Skipped, None, None, 0).await;
                continue;
            }
            if !self.stage_enabled(stage, &run.options) {
                self.finish_stage(&mut run, stage, StageStatus::Skipped, None, None, 0).await;
                continue;
            }
            let Some(executor) = self.plan.get(stage).cloned() else {
                let err = StageError::Validation(format!("No executor registered for {}", stage));
                self.finish_stage(&mut run, stage, StageStatus::Failed, None, Some(err), 0).await;
                halt = Some(Halt::MandatoryFailure);
                continue;
            };

            self.start_stage(&mut run, stage).await;
            let max_attempts = self.attempts_for(stage, &run.options);
            let (result, attempts) = self.run_with_retry(executor.as_ref(), &ctx, max_attempts).await;

            let result = match result {
                Ok(output) => self.commit(&mut run, &mut ctx, stage, output).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(artifact) => {
                    self.finish_stage(&mut run, stage, StageStatus::Succeeded, artifact, None, attempts).await;
                }
                Err(e) => {
                    let cancelled = e == StageError::Cancelled;
                    self.finish_stage(&mut run, stage, StageStatus::Failed, None, Some(e), attempts).await;
                    if cancelled {
                        halt = Some(Halt::Cancelled);
                    } else if stage.is_optional() {
                        optional_failed = true;
                    } else {
                        halt = Some(Halt::MandatoryFailure);
                    }
                }
            }
        }

        deadline_watch.cancel();
        run.status = match halt {
            Some(_) => RunStatus::Failed,
            None if optional_failed => RunStatus::PartiallyFailed,
            None => RunStatus::Completed,
        };
        let now = Utc::now();
        run.updated_at = now;
        run.finished_at = Some(now);
        self.registry.update_run(&run).await;
        self.registry.emit(EventKind::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
        });

        match halt {
            Some(Halt::Cancelled) => warn!(run_id = %run.id, unit = %run.unit, "🛑 pipeline run cancelled"),
            Some(Halt::MandatoryFailure) => error!(run_id = %run.id, unit = %run.unit, "❌ pipeline run failed"),
            None => info!(run_id = %run.id, unit = %run.unit, status = ?run.status, "✅ pipeline run finished"),
        }
        run
    }

    fn stage_enabled(&self, stage: StageId, options: &RunOptions) -> bool {
        match stage {
            StageId::MusicMix => options.add_music,
            StageId::Publish => options.publish.is_some(),
            _ => true,
        }
    }

    fn attempts_for(&self, stage: StageId, options: &RunOptions) -> u32 {
        let attempts = if stage.is_optional() {
            self.config.optional_attempts
        } else {
            options.max_attempts.unwrap_or(self.config.max_attempts)
        };
        attempts.max(1)
    }

    /// Invoke a stage until it succeeds, fails permanently or runs out of attempts
    async fn run_with_retry(
        &self,
        executor: &dyn StageExecutor,
        ctx: &RunContext,
        max_attempts: u32,
    ) -> (Result<StageOutput, StageError>, u32) {
        let stage = executor.stage();
        let mut backoff = self.config.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.registry.emit(EventKind::StageStarted {
                run_id: ctx.run_id.clone(),
                stage,
                attempt,
            });
            let err = match self.invoke_once(executor, ctx).await {
                Ok(output) => return (Ok(output), attempt),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                if err.is_retryable() {
                    warn!(run_id = %ctx.run_id, stage = %stage, attempt, error = %err, "retries exhausted");
                }
                return (Err(err), attempt);
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.retry.cap);
            warn!(
                run_id = %ctx.run_id,
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage attempt failed, retrying"
            );
            self.registry.emit(EventKind::StageRetrying {
                run_id: ctx.run_id.clone(),
                stage,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_failure(),
            });

            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return (Err(StageError::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt: acquire, invoke under a deadline, release on every path
    async fn invoke_once(&self, executor: &dyn StageExecutor, ctx: &RunContext) -> Result<StageOutput, StageError> {
        let stage = executor.stage();
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let acquire_deadline = Instant::now() + self.config.acquire_timeout;
        let token = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(StageError::Cancelled),
            acquired = self.scheduler.acquire(stage, acquire_deadline) => acquired.map_err(StageError::from)?,
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(StageError::Cancelled),
            invoked = tokio::time::timeout(self.config.stage_timeout, executor.invoke(ctx)) => match invoked {
                Ok(result) => result,
                Err(_) => Err(StageError::Transient(format!(
                    "{} did not finish within {:?}",
                    stage, self.config.stage_timeout
                ))),
            },
        };

        // Abandoned external work is cancelled while the token is still held,
        // so the next holder's job cannot be hit
        if result.is_err() {
            executor.cancel(&ctx.run_id).await;
        }
        self.scheduler.release(token);
        result
    }

    /// Register what a stage produced and make it visible to later stages
    async fn commit(
        &self,
        run: &mut PipelineRun,
        ctx: &mut RunContext,
        stage: StageId,
        output: StageOutput,
    ) -> Result<Option<ArtifactId>, StageError> {
        let draft = match output {
            StageOutput::Text(text) => {
                ctx.text = Some(text.clone());
                Some(ArtifactDraft::inline(ArtifactKind::Text, text))
            }
            StageOutput::Artifact(draft) => Some(draft),
            StageOutput::Transcript(transcription) => {
                let body = serde_json::to_string(&transcription)
                    .map_err(|e| StageError::Validation(format!("Unserializable transcript: {}", e)))?;
                let draft = ArtifactDraft::inline(ArtifactKind::Transcript, body).with_duration(transcription.duration);
                ctx.transcription = Some(transcription);
                Some(draft)
            }
            StageOutput::Plan(plan) => {
                run.sync_plan = Some(plan.clone());
                ctx.sync_plan = Some(plan);
                None
            }
            StageOutput::Published { url } => {
                info!(run_id = %run.id, url = %url, "📤 published");
                run.remote_url = Some(url);
                None
            }
        };

        let Some(draft) = draft else {
            return Ok(None);
        };
        let artifact = self
            .store
            .put(&run.id, stage, draft)
            .await
            .map_err(|e| StageError::Validation(e.to_string()))?;
        let id = artifact.id.clone();
        ctx.artifacts.insert(stage, artifact);
        Ok(Some(id))
    }

    async fn start_stage(&self, run: &mut PipelineRun, stage: StageId) {
        if let Some(result) = run.stage_mut(stage) {
            result.status = StageStatus::Running;
            result.started_at = Some(Utc::now());
        }
        run.updated_at = Utc::now();
        self.registry.update_run(run).await;
        tracing::debug!(run_id = %run.id, stage = %stage, "stage started");
    }

    async fn finish_stage(
        &self,
        run: &mut PipelineRun,
        stage: StageId,
        status: StageStatus,
        artifact: Option<ArtifactId>,
        error: Option<StageError>,
        attempts: u32,
    ) {
        let failure = error.as_ref().map(|e| e.to_failure());
        if let Some(result) = run.stage_mut(stage) {
            result.status = status;
            result.artifact = artifact.clone();
            result.error = failure.clone();
            result.attempts = attempts;
            result.finished_at = Some(Utc::now());
        }
        run.updated_at = Utc::now();
        self.registry.update_run(run).await;

        match (&status, &error) {
            (StageStatus::Failed, Some(e)) => {
                warn!(run_id = %run.id, stage = %stage, attempts, error = %e, "stage failed")
            }
            (StageStatus::Skipped, _) => tracing::debug!(run_id = %run.id, stage = %stage, "stage skipped"),
            _ => info!(run_id = %run.id, stage = %stage, attempts, "stage succeeded"),
        }
        self.registry.emit(EventKind::StageFinished {
            run_id: run.id.clone(),
            stage,
            status,
            attempts,
            artifact,
            error: failure,
        });
    }
}

/// Cancel `cancel` once `after` elapses, unless `done` fires first
fn spawn_deadline(run_id: RunId, after: Duration, cancel: CancellationToken, done: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                warn!(run_id = %run_id, deadline_secs = after.as_secs(), "run deadline expired");
                cancel.cancel();
            }
        }
    });
}
