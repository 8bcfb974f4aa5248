use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
};
use http::{HeaderMap, StatusCode, header};
use serde_json::Value;

use crate::engine::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    job::{Job, JobContext, JobOutcome},
    models::{ActiveJobSummary, ExecuteResponse, RuntimeSummary},
    runtime::RuntimeRegistry,
    validation::validate_request,
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RuntimeRegistry>,
    jobs: JobContext,
}

impl AppState {
    pub fn new(registry: Arc<RuntimeRegistry>, jobs: JobContext) -> Self {
        Self { registry, jobs }
    }
}

pub fn routes(state: AppState, config: &EngineConfig) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v3/runtimes", get(list_runtimes))
        .route("/api/v3/jobs", get(list_jobs))
        .route("/api/v3/execute", post(execute))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.jobs.metrics.render_prometheus())
}

async fn list_runtimes(State(state): State<AppState>) -> Json<Vec<RuntimeSummary>> {
    let runtimes = state
        .registry
        .iter()
        .map(|rt| RuntimeSummary {
            language: rt.language.clone(),
            version: rt.version.to_string(),
            aliases: rt.aliases.clone(),
            compiled: rt.compiled(),
        })
        .collect();
    Json(runtimes)
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<ActiveJobSummary>> {
    Json(state.jobs.tracker.snapshot())
}

async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> EngineResult<Json<ExecuteResponse>> {
    if !is_json(&headers) {
        return Err(EngineError::UnsupportedMediaType);
    }
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| EngineError::Validation(format!("request body is not valid JSON: {e}")))?;
    let params = validate_request(&body, &state.registry)?;

    let language = params.runtime.language.clone();
    let version = params.runtime.version.to_string();
    let job = Job::new(params, state.jobs.clone());
    let job_id = job.id();
    tracing::info!(%job_id, %language, %version, "job accepted");

    let JobOutcome { result, cleanup } = job.run().await;
    let outcome = result.inspect_err(|err| {
        tracing::error!(%job_id, error = %err, "job failed");
    })?;
    cleanup?;

    Ok(Json(ExecuteResponse {
        language,
        version,
        outcome,
    }))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
