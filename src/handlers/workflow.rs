// src/handlers/workflow.rs
//! Run and batch endpoints - submit, inspect, cancel

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::StageError;
use crate::types::{ContentUnit, MontageSpec, PlatformProfile, RunOptions};
use crate::zodiac::Sign;
use crate::AppState;

#[derive(Deserialize, Debug)]
pub struct RunRequest {
    pub sign: String,
    /// YYYY-MM-DD, today when absent
    pub date: Option<String>,
    pub locale: Option<String>,
    pub profile: Option<PlatformProfile>,
    /// Full override of the profile preset
    pub montage: Option<MontageSpec>,
    #[serde(default)]
    pub options: RunOptions,
}

/// One content unit of a batch; date and locale fall back to the batch values
#[derive(Deserialize, Debug)]
pub struct UnitRequest {
    pub sign: String,
    pub date: Option<String>,
    pub locale: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct BatchRequest {
    /// Explicit units, for batches mixing dates or locales
    #[serde(default, alias = "contentUnits")]
    pub units: Option<Vec<UnitRequest>>,
    /// Shorthand: these signs on the batch date. Every sign when neither is set.
    pub signs: Option<Vec<String>>,
    pub date: Option<String>,
    pub locale: Option<String>,
    pub profile: Option<PlatformProfile>,
    pub montage: Option<MontageSpec>,
    #[serde(default)]
    pub options: RunOptions,
}

fn resolve_montage(montage: Option<MontageSpec>, profile: Option<PlatformProfile>) -> MontageSpec {
    montage.unwrap_or_else(|| MontageSpec::for_profile(profile.unwrap_or(PlatformProfile::YoutubeShort)))
}

fn resolve_date(date: &Option<String>) -> String {
    date.clone().unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string())
}

fn parse_units(
    explicit: Option<Vec<UnitRequest>>,
    signs: Option<Vec<String>>,
    date: &Option<String>,
    locale: Option<&str>,
) -> Result<Vec<ContentUnit>, StageError> {
    let requested = match (explicit, signs) {
        (Some(_), Some(_)) => {
            return Err(StageError::Validation("Give either units or signs, not both".to_string()));
        }
        (Some(explicit), None) => explicit,
        (None, signs) => signs
            .unwrap_or_else(|| Sign::ALL.iter().map(|s| s.as_str().to_string()).collect())
            .into_iter()
            .map(|sign| UnitRequest {
                sign,
                date: None,
                locale: None,
            })
            .collect(),
    };

    let mut units: Vec<ContentUnit> = Vec::with_capacity(requested.len());
    for request in requested {
        let unit_date = resolve_date(if request.date.is_some() { &request.date } else { date });
        let unit = ContentUnit::parse(&request.sign, &unit_date, request.locale.as_deref().or(locale))?;
        if units.contains(&unit) {
            return Err(StageError::Validation(format!("Duplicate content unit {}", unit)));
        }
        units.push(unit);
    }
    Ok(units)
}

fn rejected(err: StageError) -> axum::response::Response {
    tracing::warn!("Rejected workflow request: {}", err);
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

/// POST /workflow/run - Start one pipeline run in the background
pub async fn submit_run(Extension(state): Extension<Arc<AppState>>, Json(request): Json<RunRequest>) -> impl IntoResponse {
    let unit = match ContentUnit::parse(&request.sign, &resolve_date(&request.date), request.locale.as_deref()) {
        Ok(unit) => unit,
        Err(e) => return rejected(e),
    };
    let montage = resolve_montage(request.montage, request.profile);

    match state.runner.start(unit.clone(), montage, request.options).await {
        Ok(run_id) => {
            tracing::info!(run_id = %run_id, unit = %unit, "🚀 run submitted");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "run_id": run_id, "unit": unit, "status": "pending" })),
            )
                .into_response()
        }
        Err(e) => rejected(e),
    }
}

/// GET /workflow/run/:run_id - Full run state
pub async fn get_run(Path(run_id): Path<String>, Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.runner.registry().get_run(&run_id).await {
        Some(run) => (StatusCode::OK, Json(run)).into_response(),
        None => (StatusCode::NOT_FOUND, "Run not found").into_response(),
    }
}

/// GET /workflow/run/:run_id/artifacts - Artifacts produced so far
pub async fn get_run_artifacts(Path(run_id): Path<String>, Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    if state.runner.registry().get_run(&run_id).await.is_none() {
        return (StatusCode::NOT_FOUND, "Run not found").into_response();
    }
    let artifacts = state.runner.store().list_for(&run_id).await;
    (StatusCode::OK, Json(artifacts)).into_response()
}

/// GET /workflow/runs - Run summaries, newest first
pub async fn list_runs(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let runs = state.runner.registry().list_runs().await;
    (StatusCode::OK, Json(serde_json::json!({ "count": runs.len(), "runs": runs })))
}

/// POST /workflow/batch - Fan a set of signs out as one batch
pub async fn submit_batch(Extension(state): Extension<Arc<AppState>>, Json(request): Json<BatchRequest>) -> impl IntoResponse {
    let units = match parse_units(request.units, request.signs, &request.date, request.locale.as_deref()) {
        Ok(units) => units,
        Err(e) => return rejected(e),
    };
    let montage = resolve_montage(request.montage, request.profile);
    let total = units.len();

    match state.batches.start_batch(units, montage, request.options).await {
        Ok(batch_id) => {
            tracing::info!(batch_id = %batch_id, total, "🚀 batch submitted");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "batch_id": batch_id, "total": total, "status": "running" })),
            )
                .into_response()
        }
        Err(e) => rejected(e),
    }
}

/// GET /workflow/batch/:batch_id - Batch state with live per-unit statuses
pub async fn get_batch(Path(batch_id): Path<String>, Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.runner.registry().batch_snapshot(&batch_id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (StatusCode::NOT_FOUND, "Batch not found").into_response(),
    }
}

/// POST /workflow/run/:id/cancel and /workflow/batch/:id/cancel
pub async fn cancel(Path(id): Path<String>, Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.runner.registry();
    if registry.cancel(&id).await {
        return (StatusCode::ACCEPTED, format!("Cancellation requested for {}", id)).into_response();
    }
    let known = registry.get_run(&id).await.is_some() || registry.get_batch(&id).await.is_some();
    if known {
        (StatusCode::CONFLICT, format!("{} already finished", id)).into_response()
    } else {
        (StatusCode::NOT_FOUND, "Run or batch not found").into_response()
    }
}

/// GET /workflow/artifacts/:artifact_id - Artifact metadata
pub async fn get_artifact(Path(artifact_id): Path<String>, Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.runner.store().get(&artifact_id).await {
        Some(artifact) => (StatusCode::OK, Json(artifact)).into_response(),
        None => (StatusCode::NOT_FOUND, "Artifact not found").into_response(),
    }
}

/// Routes for workflow management
pub fn workflow_routes() -> Router {
    Router::new()
        .route("/workflow/run", post(submit_run))
        .route("/workflow/run/:id", get(get_run))
        .route("/workflow/run/:id/artifacts", get(get_run_artifacts))
        .route("/workflow/run/:id/cancel", post(cancel))
        .route("/workflow/runs", get(list_runs))
        .route("/workflow/batch", post(submit_batch))
        .route("/workflow/batch/:id", get(get_batch))
        .route("/workflow/batch/:id/cancel", post(cancel))
        .route("/workflow/artifacts/:id", get(get_artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_state;
    use crate::types::{PipelineRun, StageId};
    use crate::workflow::testing::{FakeWorld, Script};
    use std::time::Duration;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn run_request(sign: &str) -> RunRequest {
        RunRequest {
            sign: sign.to_string(),
            date: Some("2026-10-19".to_string()),
            locale: None,
            profile: Some(PlatformProfile::Test),
            montage: None,
            options: RunOptions::default(),
        }
    }

    async fn wait_terminal(state: &Arc<AppState>, run_id: &str) -> PipelineRun {
        for _ in 0..500 {
            if let Some(run) = state.runner.registry().get_run(run_id).await {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never finished", run_id);
    }

    #[tokio::test]
    async fn test_submit_run_then_fetch_it() {
        let world = FakeWorld::new();
        let state = test_state(&world);

        let response = submit_run(Extension(state.clone()), Json(run_request("Leo"))).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let run_id = body["run_id"].as_str().unwrap().to_string();
        assert_eq!(body["unit"]["sign"], "leo");

        let run = wait_terminal(&state, &run_id).await;
        assert_eq!(run.montage.width, 512);

        let response = get_run(Path(run_id.clone()), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], run_id);

        let final_video = run.final_video().unwrap().to_string();
        let response = get_artifact(Path(final_video), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["kind"], "final_video");

        let response = get_run_artifacts(Path(run_id), Extension(state)).await.into_response();
        assert!(body_json(response).await.as_array().unwrap().len() >= 5);
    }

    #[tokio::test]
    async fn test_unknown_sign_and_bad_date_are_rejected() {
        let state = test_state(&FakeWorld::new());

        let response = submit_run(Extension(state.clone()), Json(run_request("ophiuchus"))).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut request = run_request("leo");
        request.date = Some("19/10/2026".to_string());
        let response = submit_run(Extension(state.clone()), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.runner.registry().list_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let state = test_state(&FakeWorld::new());
        let response = get_run(Path("nope".into()), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = get_batch(Path("nope".into()), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = get_artifact(Path("nope".into()), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = cancel(Path("nope".into()), Extension(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_running_run_then_conflict_once_finished() {
        let world = FakeWorld::new();
        world.script(StageId::VideoGeneration, Script::Hang).await;
        let state = test_state(&world);

        let response = submit_run(Extension(state.clone()), Json(run_request("aries"))).await.into_response();
        let run_id = body_json(response).await["run_id"].as_str().unwrap().to_string();

        let response = cancel(Path(run_id.clone()), Extension(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let run = wait_terminal(&state, &run_id).await;
        assert_eq!(run.status, crate::types::RunStatus::Failed);

        let response = cancel(Path(run_id), Extension(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_batch_defaults_to_every_sign_and_rejects_duplicates() {
        let date = Some("2026-10-19".to_string());
        let units = parse_units(None, None, &date, None).unwrap();
        assert_eq!(units.len(), 12);
        assert_eq!(units[0].sign, Sign::Aries);

        let err = parse_units(None, Some(vec!["leo".into(), "LEO".into()]), &date, None).unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
    }

    #[test]
    fn test_explicit_units_override_batch_date_and_locale() {
        let explicit = vec![
            UnitRequest { sign: "leo".into(), date: Some("2026-10-20".into()), locale: None },
            UnitRequest { sign: "leo".into(), date: None, locale: Some("en".into()) },
        ];
        let units = parse_units(Some(explicit), None, &Some("2026-10-19".into()), Some("fr")).unwrap();
        assert_eq!(units[0].date.to_string(), "2026-10-20");
        assert_eq!(units[0].locale, "fr");
        assert_eq!(units[1].date.to_string(), "2026-10-19");
        assert_eq!(units[1].locale, "en");

        let both = parse_units(Some(Vec::new()), Some(vec!["leo".into()]), &None, None).unwrap_err();
        assert!(matches!(both, StageError::Validation(_)));
    }

    #[tokio::test]
    async fn test_batch_with_mixed_dates_combines_in_date_order() {
        let world = FakeWorld::new();
        let state = test_state(&world);
        let request: BatchRequest = serde_json::from_value(serde_json::json!({
            "contentUnits": [
                { "sign": "leo", "date": "2026-10-20" },
                { "sign": "leo", "date": "2026-10-19" }
            ],
            "profile": "test"
        }))
        .unwrap();
        let response = submit_batch(Extension(state.clone()), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let batch_id = body_json(response).await["batch_id"].as_str().unwrap().to_string();

        let mut finished = None;
        for _ in 0..500 {
            let batch = state.runner.registry().get_batch(&batch_id).await.unwrap();
            if batch.finished_at.is_some() {
                finished = Some(batch);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let batch = finished.expect("batch never finished");
        assert_eq!(batch.counts.succeeded, 2);
        assert!(batch.combined.is_some());

        let concatenations = world.fakes.concatenations.lock().await.clone();
        assert_eq!(concatenations.len(), 1);
        let parts = &concatenations[0];
        assert!(parts[0].ends_with("leo@2026-10-19[fr]"), "{:?}", parts);
        assert!(parts[1].ends_with("leo@2026-10-20[fr]"), "{:?}", parts);
    }

    #[tokio::test]
    async fn test_submit_batch_and_read_snapshot() {
        let state = test_state(&FakeWorld::new());
        let request = BatchRequest {
            units: None,
            signs: Some(vec!["aries".into(), "taurus".into()]),
            date: Some("2026-10-19".into()),
            locale: None,
            profile: Some(PlatformProfile::Test),
            montage: None,
            options: RunOptions::default(),
        };
        let response = submit_batch(Extension(state.clone()), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let batch_id = body_json(response).await["batch_id"].as_str().unwrap().to_string();

        let response = get_batch(Path(batch_id), Extension(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["runs"].as_array().unwrap().len(), 2);
        assert_eq!(body["counts"]["total"], 2);
    }
}
