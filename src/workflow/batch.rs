// BatchCoordinator - fan out one PipelineRun per unit, isolate failures, combine
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::runner::PipelineRunner;
use super::stages::Assembler;
use super::state::EventKind;
use crate::error::StageError;
use crate::types::{
    new_id, Artifact, ArtifactKind, BatchCounts, BatchId, BatchRun, BatchStatus, ContentUnit, MontageSpec,
    PipelineRun, RunOptions, RunStatus, StageId, StageStatus,
};

/// Minimum number of finished videos worth combining
const MIN_COMBINED_PARTS: usize = 2;

pub struct BatchCoordinator {
    runner: Arc<PipelineRunner>,
    assembler: Arc<dyn Assembler>,
}

/// A registered batch whose runs have not been dispatched yet
struct PreparedBatch {
    batch: BatchRun,
    runs: Vec<(PipelineRun, CancellationToken)>,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(runner: Arc<PipelineRunner>, assembler: Arc<dyn Assembler>) -> Self {
        Self { runner, assembler }
    }

    /// Run every unit to a terminal state and build the combined deliverable
    pub async fn run_batch(&self, units: Vec<ContentUnit>, montage: MontageSpec, options: RunOptions) -> Result<BatchRun, StageError> {
        let prepared = self.prepare(units, montage, options).await?;
        Ok(self.drive(prepared).await)
    }

    /// Register a batch and drive it in the background
    pub async fn start_batch(
        self: &Arc<Self>,
        units: Vec<ContentUnit>,
        montage: MontageSpec,
        options: RunOptions,
    ) -> Result<BatchId, StageError> {
        let prepared = self.prepare(units, montage, options).await?;
        let batch_id = prepared.batch.id.clone();
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(prepared).await;
        });
        Ok(batch_id)
    }

    async fn prepare(&self, units: Vec<ContentUnit>, montage: MontageSpec, options: RunOptions) -> Result<PreparedBatch, StageError> {
        if units.is_empty() {
            return Err(StageError::Validation("A batch needs at least one content unit".to_string()));
        }
        montage.validate()?;

        let batch_id = new_id();
        let cancel = CancellationToken::new();
        let mut runs = Vec::with_capacity(units.len());
        for unit in units {
            let prepared = self
                .runner
                .prepare(unit, montage.clone(), options.clone(), Some(batch_id.clone()), cancel.clone())
                .await?;
            runs.push(prepared);
        }

        let batch = BatchRun::new(batch_id, runs.iter().map(|(run, _)| run.id.clone()).collect(), montage);
        self.runner.registry().insert_batch(batch.clone(), cancel.clone()).await;
        info!(batch_id = %batch.id, units = batch.runs.len(), "📦 batch registered");
        Ok(PreparedBatch { batch, runs, cancel })
    }

    async fn drive(&self, prepared: PreparedBatch) -> BatchRun {
        let PreparedBatch { mut batch, runs, cancel } = prepared;
        let registry = self.runner.registry().clone();

        // Every unit is dispatched at once; pools alone decide who waits
        let handles: Vec<_> = runs
            .into_iter()
            .map(|(run, token)| {
                let runner = self.runner.clone();
                let fallback = run.clone();
                (fallback, tokio::spawn(async move { runner.execute(run, token).await }))
            })
            .collect();
        let (fallbacks, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

        let mut finished = Vec::with_capacity(fallbacks.len());
        for (mut fallback, joined) in fallbacks.into_iter().zip(join_all(joins).await) {
            match joined {
                Ok(run) => finished.push(run),
                Err(e) => {
                    error!(batch_id = %batch.id, run_id = %fallback.id, error = %e, "pipeline task aborted");
                    fallback.status = RunStatus::Failed;
                    fallback.finished_at = Some(Utc::now());
                    registry.update_run(&fallback).await;
                    finished.push(fallback);
                }
            }
        }

        batch.counts = BatchCounts::tally(batch.runs.len(), finished.iter().map(|r| &r.status));
        info!(
            batch_id = %batch.id,
            total = batch.counts.total,
            succeeded = batch.counts.succeeded,
            failed = batch.counts.failed,
            "batch runs finished"
        );

        let survivors = self.survivors(&finished).await;
        if survivors.len() >= MIN_COMBINED_PARTS {
            if cancel.is_cancelled() {
                batch.combined_error = Some(StageError::Cancelled.to_failure());
            } else {
                match self.combine(&batch, &survivors).await {
                    Ok(artifact) => batch.combined = Some(artifact.id),
                    Err(e) => {
                        warn!(batch_id = %batch.id, error = %e, "combined assembly failed");
                        batch.combined_error = Some(e.to_failure());
                    }
                }
            }
        } else {
            info!(
                batch_id = %batch.id,
                survivors = survivors.len(),
                "fewer than {} finished videos, combined assembly skipped",
                MIN_COMBINED_PARTS
            );
        }

        batch.status = BatchStatus::Finished;
        batch.finished_at = Some(Utc::now());
        registry.update_batch(&batch).await;
        registry.emit(EventKind::BatchFinished {
            batch_id: batch.id.clone(),
            counts: batch.counts,
            combined: batch.combined.clone(),
        });
        batch
    }

    /// Final videos of runs that got through Assembly, in canonical unit order
    async fn survivors(&self, runs: &[PipelineRun]) -> Vec<Artifact> {
        let mut ordered: Vec<&PipelineRun> = runs
            .iter()
            .filter(|r| r.status != RunStatus::Failed)
            .filter(|r| r.stage(StageId::Assembly).map(|s| s.status) == Some(StageStatus::Succeeded))
            .collect();
        ordered.sort_by(|a, b| a.unit.canonical_cmp(&b.unit));

        let mut parts = Vec::with_capacity(ordered.len());
        for run in ordered {
            let Some(id) = run.final_video() else {
                continue;
            };
            match self.runner.store().get(id).await {
                Some(artifact) => parts.push(artifact),
                None => warn!(run_id = %run.id, artifact_id = %id, "final video missing from store"),
            }
        }
        parts
    }

    /// One concatenation pass under an Assembly token
    async fn combine(&self, batch: &BatchRun, parts: &[Artifact]) -> Result<Artifact, StageError> {
        let scheduler = self.runner.scheduler();
        let deadline = Instant::now() + self.runner.config().acquire_timeout;
        let token = scheduler.acquire(StageId::Assembly, deadline).await?;

        let output = self
            .runner
            .config()
            .output_dir
            .join(format!("batch-{}", batch.id))
            .join("combined.mp4");
        let result = tokio::time::timeout(
            self.runner.config().stage_timeout,
            self.assembler.concatenate(parts, &batch.montage, &output),
        )
        .await;
        scheduler.release(token);

        let mut draft = match result {
            Ok(draft) => draft?,
            Err(_) => return Err(StageError::Assembly("Combined assembly timed out".to_string())),
        };
        draft.kind = ArtifactKind::CombinedVideo;

        let artifact = self
            .runner
            .store()
            .put(&batch.id, StageId::Assembly, draft)
            .await
            .map_err(|e| StageError::Assembly(e.to_string()))?;
        info!(batch_id = %batch.id, artifact_id = %artifact.id, parts = parts.len(), "🎞️ combined video assembled");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::scheduler::PoolSizes;
    use crate::workflow::testing::{unit, FakeWorld, Script};
    use crate::zodiac::Sign;
    use std::time::Duration;

    fn coordinator(world: &FakeWorld) -> Arc<BatchCoordinator> {
        Arc::new(BatchCoordinator::new(Arc::new(world.runner()), world.fakes.clone()))
    }

    #[tokio::test]
    async fn test_render_failures_are_isolated_and_survivors_combined() {
        let world = FakeWorld::new();
        world.script_for(StageId::VideoGeneration, Sign::Taurus, Script::FailValidation).await;
        world.script_for(StageId::VideoGeneration, Sign::Leo, Script::FailTransient(10)).await;
        let coordinator = coordinator(&world);

        let units = vec![unit(Sign::Virgo), unit(Sign::Taurus), unit(Sign::Aries), unit(Sign::Leo), unit(Sign::Gemini)];
        let batch = coordinator
            .run_batch(units, MontageSpec::default(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(batch.counts.total, 5);
        assert_eq!(batch.counts.succeeded, 3);
        assert_eq!(batch.counts.failed, 2);
        assert_eq!(batch.counts.in_flight, 0);
        assert_eq!(batch.status, BatchStatus::Finished);

        let combined = world.store.get(batch.combined.as_ref().unwrap()).await.unwrap();
        assert_eq!(combined.kind, ArtifactKind::CombinedVideo);
        assert_eq!(combined.owner, batch.id);

        // Canonical sign order, failed units left out
        let concatenations = world.fakes.concatenations.lock().await;
        assert_eq!(concatenations.len(), 1);
        let order: Vec<&str> = concatenations[0]
            .iter()
            .map(|loc| loc.rsplit('#').next().unwrap().split('@').next().unwrap())
            .collect();
        assert_eq!(order, vec!["aries", "gemini", "virgo"]);
    }

    #[tokio::test]
    async fn test_single_survivor_skips_combined_assembly() {
        let world = FakeWorld::new();
        world.script_for(StageId::VideoGeneration, Sign::Cancer, Script::FailValidation).await;
        let coordinator = coordinator(&world);

        let batch = coordinator
            .run_batch(vec![unit(Sign::Cancer), unit(Sign::Libra)], MontageSpec::default(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.counts.succeeded, 1);
        assert!(batch.combined.is_none());
        assert!(batch.combined_error.is_none());
        assert!(world.fakes.concatenations.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_partially_failed_runs_still_count_and_combine() {
        let world = FakeWorld::new();
        world.script_for(StageId::MusicMix, Sign::Pisces, Script::FailTransient(10)).await;
        let coordinator = coordinator(&world);

        let batch = coordinator
            .run_batch(vec![unit(Sign::Pisces), unit(Sign::Aquarius)], MontageSpec::default(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.counts.partially_failed, 1);
        assert_eq!(batch.counts.completed, 1);
        assert_eq!(batch.counts.succeeded, 2);
        assert!(batch.combined.is_some());
    }

    #[tokio::test]
    async fn test_serialized_render_pool_never_overlaps() {
        let world = FakeWorld::with_pools(PoolSizes::uniform(4, 1));
        let render_time = Duration::from_millis(60);
        world.set_latency(StageId::VideoGeneration, render_time).await;
        let coordinator = coordinator(&world);

        let started = std::time::Instant::now();
        let batch = coordinator
            .run_batch(
                vec![unit(Sign::Aries), unit(Sign::Taurus), unit(Sign::Gemini)],
                MontageSpec::default(),
                RunOptions::default(),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(batch.counts.completed, 3);

        let renders = world.log.for_stage(StageId::VideoGeneration).await;
        assert_eq!(renders.len(), 3);
        for pair in renders.windows(2) {
            assert!(pair[0].end <= pair[1].start, "render intervals overlap");
        }
        // Close to the sum of render times, not the max
        assert!(elapsed >= render_time * 3);

        let peak = world
            .scheduler
            .stats()
            .into_iter()
            .find(|s| s.stage == StageId::VideoGeneration)
            .unwrap()
            .peak;
        assert_eq!(peak, 1);
    }

    #[tokio::test]
    async fn test_pool_bound_holds_under_wide_batch() {
        let world = FakeWorld::with_pools(PoolSizes::uniform(2, 1));
        world.set_latency(StageId::SpeechSynthesis, Duration::from_millis(15)).await;
        let coordinator = coordinator(&world);

        let batch = coordinator
            .run_batch(Sign::ALL.iter().map(|s| unit(*s)).collect(), MontageSpec::default(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.counts.succeeded, 12);

        for stats in world.scheduler.stats() {
            assert!(stats.peak <= stats.capacity, "{} peaked at {}", stats.stage, stats.peak);
        }
        assert!(world.scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_batch_cancellation_terminates_runs_and_frees_pools() {
        let world = FakeWorld::with_pools(PoolSizes::uniform(2, 1));
        world.set_latency(StageId::VideoGeneration, Duration::from_secs(30)).await;
        let coordinator = coordinator(&world);

        let batch_id = coordinator
            .start_batch(
                vec![unit(Sign::Aries), unit(Sign::Taurus), unit(Sign::Gemini)],
                MontageSpec::default(),
                RunOptions::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(world.registry.cancel(&batch_id).await);

        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = world.registry.batch_snapshot(&batch_id).await.unwrap();
                if snapshot.batch.status == BatchStatus::Finished {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(snapshot.batch.counts.failed, 3);
        assert!(snapshot.units.iter().all(|u| u.status.is_terminal()));
        assert!(snapshot.batch.combined.is_none());
        assert!(world.scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let world = FakeWorld::new();
        let coordinator = coordinator(&world);
        let err = coordinator
            .run_batch(Vec::new(), MontageSpec::default(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
    }
}
