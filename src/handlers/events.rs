// src/handlers/events.rs
//! WebSocket stream of stage-transition events

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::workflow::{EventKind, StageEvent};
use crate::AppState;

#[derive(Deserialize, Debug, Default)]
pub struct EventQuery {
    /// Only forward events for this run
    pub run_id: Option<String>,
}

/// Run-scoped events match on their run id; batch events always pass
pub fn event_matches(event: &StageEvent, run_id: Option<&str>) -> bool {
    let Some(wanted) = run_id else {
        return true;
    };
    match &event.kind {
        EventKind::RunStarted { run_id, .. }
        | EventKind::StageStarted { run_id, .. }
        | EventKind::StageRetrying { run_id, .. }
        | EventKind::StageFinished { run_id, .. }
        | EventKind::RunFinished { run_id, .. } => run_id == wanted,
        EventKind::BatchFinished { .. } => false,
    }
}

async fn events_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<EventQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_events(socket, state, params.run_id))
}

async fn stream_events(stream: WebSocket, state: Arc<AppState>, run_id: Option<String>) {
    let (mut sender, mut receiver) = stream.split();
    let mut events = state.runner.registry().subscribe();
    tracing::info!(filter = ?run_id, "🔌 event subscriber connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !event_matches(&event, run_id.as_deref()) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&event) {
                            Ok(payload) => payload,
                            Err(e) => {
                                tracing::error!("Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    tracing::info!("event subscriber disconnected");
}

pub fn event_routes() -> Router {
    Router::new().route("/workflow/events", get(events_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchCounts, RunStatus, StageId};
    use chrono::Utc;

    fn event(kind: EventKind) -> StageEvent {
        StageEvent { timestamp: Utc::now(), kind }
    }

    #[test]
    fn test_filter_by_run_id() {
        let started = event(EventKind::StageStarted {
            run_id: "r1".into(),
            stage: StageId::TextGeneration,
            attempt: 1,
        });
        assert!(event_matches(&started, None));
        assert!(event_matches(&started, Some("r1")));
        assert!(!event_matches(&started, Some("r2")));

        let finished = event(EventKind::RunFinished { run_id: "r2".into(), status: RunStatus::Completed });
        assert!(event_matches(&finished, Some("r2")));
    }

    #[test]
    fn test_batch_events_only_reach_unfiltered_subscribers() {
        let batch = event(EventKind::BatchFinished {
            batch_id: "b".into(),
            counts: BatchCounts::default(),
            combined: None,
        });
        assert!(event_matches(&batch, None));
        assert!(!event_matches(&batch, Some("r1")));
    }
}
