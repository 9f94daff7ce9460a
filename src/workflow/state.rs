// RunRegistry - in-memory run/batch snapshots, cancel handles and the event feed
//
// Snapshots are replaced wholesale on every transition, so readers always see
// a consistent PipelineRun even while the run is in flight.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use super::checkpoint::RunCheckpointer;
use crate::error::StageFailure;
use crate::types::{
    ArtifactId, BatchCounts, BatchId, BatchRun, BatchStatus, ContentUnit, PipelineRun, RunId, RunStatus, StageId,
    StageStatus,
};

const EVENT_BUFFER: usize = 1024;

/// Stage-transition notification for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        run_id: RunId,
        batch_id: Option<BatchId>,
        unit: String,
    },
    StageStarted {
        run_id: RunId,
        stage: StageId,
        attempt: u32,
    },
    StageRetrying {
        run_id: RunId,
        stage: StageId,
        attempt: u32,
        delay_ms: u64,
        error: StageFailure,
    },
    StageFinished {
        run_id: RunId,
        stage: StageId,
        status: StageStatus,
        attempts: u32,
        artifact: Option<ArtifactId>,
        error: Option<StageFailure>,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
    BatchFinished {
        batch_id: BatchId,
        counts: BatchCounts,
        combined: Option<ArtifactId>,
    },
}

/// Compact listing entry for `GET /workflow/runs` and batch snapshots
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub batch_id: Option<BatchId>,
    pub unit: ContentUnit,
    pub status: RunStatus,
    pub current_stage: Option<StageId>,
    pub final_video: Option<ArtifactId>,
    pub error: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id.clone(),
            batch_id: run.batch_id.clone(),
            unit: run.unit.clone(),
            status: run.status,
            current_stage: run
                .stages
                .iter()
                .find(|s| s.status == StageStatus::Running)
                .map(|s| s.stage),
            final_video: run.final_video().cloned(),
            error: run.first_failure().and_then(|s| s.error.clone()),
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}

/// BatchRun plus live per-unit statuses
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    #[serde(flatten)]
    pub batch: BatchRun,
    pub units: Vec<RunSummary>,
}

pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, PipelineRun>>,
    batches: RwLock<HashMap<BatchId, BatchRun>>,
    /// Cancel handles for runs and batches still in flight
    cancels: RwLock<HashMap<String, CancellationToken>>,
    events: broadcast::Sender<StageEvent>,
    checkpointer: Option<Arc<RunCheckpointer>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            runs: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            events,
            checkpointer: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<RunCheckpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    // ---- runs ---------------------------------------------------------------

    pub async fn insert_run(&self, run: PipelineRun, cancel: CancellationToken) {
        let run_id = run.id.clone();
        self.runs.write().await.insert(run_id.clone(), run);
        self.cancels.write().await.insert(run_id.clone(), cancel);
        tracing::debug!(run_id = %run_id, "registered run");
    }

    /// Replace the stored snapshot; terminal snapshots go to the recovery log
    pub async fn update_run(&self, run: &PipelineRun) {
        self.runs.write().await.insert(run.id.clone(), run.clone());

        if run.status.is_terminal() {
            self.cancels.write().await.remove(&run.id);
            if let Some(checkpointer) = &self.checkpointer {
                if let Err(e) = checkpointer.save_run(run).await {
                    tracing::warn!(run_id = %run.id, error = %e, "failed to checkpoint run");
                }
            }
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Option<PipelineRun> {
        if let Some(run) = self.runs.read().await.get(run_id) {
            return Some(run.clone());
        }
        let checkpointer = self.checkpointer.as_ref()?;
        match checkpointer.load_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to load run checkpoint");
                None
            }
        }
    }

    /// Newest first
    pub async fn list_runs(&self) -> Vec<RunSummary> {
        let runs = self.runs.read().await;
        let mut list: Vec<RunSummary> = runs.values().map(RunSummary::from).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    // ---- batches ------------------------------------------------------------

    pub async fn insert_batch(&self, batch: BatchRun, cancel: CancellationToken) {
        let batch_id = batch.id.clone();
        self.batches.write().await.insert(batch_id.clone(), batch);
        self.cancels.write().await.insert(batch_id.clone(), cancel);
        tracing::debug!(batch_id = %batch_id, "registered batch");
    }

    pub async fn update_batch(&self, batch: &BatchRun) {
        self.batches.write().await.insert(batch.id.clone(), batch.clone());

        if batch.status == BatchStatus::Finished {
            self.cancels.write().await.remove(&batch.id);
            if let Some(checkpointer) = &self.checkpointer {
                if let Err(e) = checkpointer.save_batch(batch).await {
                    tracing::warn!(batch_id = %batch.id, error = %e, "failed to checkpoint batch");
                }
            }
        }
    }

    pub async fn get_batch(&self, batch_id: &str) -> Option<BatchRun> {
        if let Some(batch) = self.batches.read().await.get(batch_id) {
            return Some(batch.clone());
        }
        let checkpointer = self.checkpointer.as_ref()?;
        checkpointer.load_batch(batch_id).await.ok().flatten()
    }

    /// Batch state with counts recomputed from the current run snapshots
    pub async fn batch_snapshot(&self, batch_id: &str) -> Option<BatchSnapshot> {
        let mut batch = self.get_batch(batch_id).await?;
        let mut units = Vec::with_capacity(batch.runs.len());
        {
            let runs = self.runs.read().await;
            for run_id in &batch.runs {
                if let Some(run) = runs.get(run_id) {
                    units.push(RunSummary::from(run));
                }
            }
        }
        if units.len() == batch.runs.len() {
            batch.counts = BatchCounts::tally(batch.runs.len(), units.iter().map(|u| &u.status));
        }
        Some(BatchSnapshot { batch, units })
    }

    // ---- cancellation -------------------------------------------------------

    /// Cancel a run or batch by id; false when it is unknown or already done
    pub async fn cancel(&self, id: &str) -> bool {
        let cancels = self.cancels.read().await;
        match cancels.get(id) {
            Some(token) => {
                token.cancel();
                tracing::info!(id = %id, "🛑 cancellation requested");
                true
            }
            None => false,
        }
    }

    // ---- events -------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        // No subscribers is the normal case
        let _ = self.events.send(StageEvent {
            timestamp: Utc::now(),
            kind,
        });
    }

    // ---- retention ----------------------------------------------------------

    pub async fn counts(&self) -> (usize, usize) {
        (self.runs.read().await.len(), self.batches.read().await.len())
    }

    /// Evict terminal runs and finished batches older than `max_age_hours`.
    /// Returns the evicted ids so their artifact metadata can be dropped too.
    pub async fn cleanup_old(&self, max_age_hours: i64) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut evicted = Vec::new();

        {
            let mut runs = self.runs.write().await;
            runs.retain(|id, run| {
                let expired = run.status.is_terminal() && run.finished_at.map(|t| t < cutoff).unwrap_or(false);
                if expired {
                    evicted.push(id.clone());
                }
                !expired
            });
        }
        {
            let mut batches = self.batches.write().await;
            batches.retain(|id, batch| {
                let expired = batch.status == BatchStatus::Finished && batch.finished_at.map(|t| t < cutoff).unwrap_or(false);
                if expired {
                    evicted.push(id.clone());
                }
                !expired
            });
        }

        if !evicted.is_empty() {
            tracing::info!("🗑️ Evicted {} finished runs/batches", evicted.len());
        }
        evicted
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
