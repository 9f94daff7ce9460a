// src/handlers/mod.rs
use serde::Serialize;
use std::sync::Arc;

use crate::workflow::{BatchCoordinator, PipelineRunner};

pub mod events;
pub mod status;
pub mod workflow;

/// Shared state injected into every handler through `Extension`
pub struct AppState {
    pub runner: Arc<PipelineRunner>,
    pub batches: Arc<BatchCoordinator>,
    /// Collaborator adapters and whether each one is wired to a real endpoint
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub configured: bool,
}

impl ServiceStatus {
    pub fn new(name: &str, configured: bool) -> Self {
        Self {
            name: name.to_string(),
            configured,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(world: &crate::workflow::testing::FakeWorld) -> Arc<AppState> {
    let runner = Arc::new(world.runner());
    let batches = Arc::new(BatchCoordinator::new(runner.clone(), world.fakes.clone()));
    Arc::new(AppState {
        runner,
        batches,
        services: vec![ServiceStatus::new("fake", true)],
    })
}
