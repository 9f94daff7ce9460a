// Workflow orchestration engine - stage sequencing, token pools, batching, sync planning
pub mod artifacts;
pub mod batch;
pub mod checkpoint;
pub mod runner;
pub mod scheduler;
pub mod stages;
pub mod state;
pub mod sync_planner;

#[cfg(test)]
pub(crate) mod testing;

pub use artifacts::{ArtifactDraft, ArtifactStore};
pub use batch::BatchCoordinator;
pub use checkpoint::RunCheckpointer;
pub use runner::{PipelineRunner, RetryPolicy, RunnerConfig};
pub use scheduler::{PoolSizes, PoolStats, ResourceScheduler, StageToken};
pub use stages::{Collaborators, PollConfig, StageExecutor, StagePlan};
pub use state::{EventKind, RunRegistry, RunSummary, StageEvent};
pub use sync_planner::{CueConfig, SyncPlanner};
