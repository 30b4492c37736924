//! Management API: read-only views of the telemetry store and the switch
//! write path into the orchestrator. Meant to be bound on loopback only.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use llamactl_common::{ActiveModel, ContainerMetrics, ControlError, GpuMetrics, HostMetrics, LifecycleState};
use llamactl_core::{ControlPlane, ExitIntent, LifecycleView};
use llamactl_obs::TelemetryMetrics;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AppState {
    plane: ControlPlane,
    metrics: Arc<TelemetryMetrics>,
}

pub fn app(plane: ControlPlane) -> prometheus::Result<Router> {
    let state = AppState { plane, metrics: Arc::new(TelemetryMetrics::new()?) };
    Ok(Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/models", get(models))
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/telemetry", get(telemetry))
        .route("/metrics", get(metrics))
        .route("/switch", post(switch))
        .route("/shutdown", post(shutdown))
        .with_state(state))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    id: String,
    name: String,
    speed: String,
    context_size: String,
    is_benchmark: bool,
    active: bool,
}

async fn models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    let active = state.plane.store.lifecycle().active_model.map(|m| m.profile_id);
    let entries = state
        .plane
        .profiles
        .all()
        .iter()
        .map(|p| ModelEntry {
            id: p.id.clone(),
            name: p.display_name().to_string(),
            speed: p.speed.clone(),
            context_size: p.ctx_size.clone(),
            is_benchmark: p.benchmark,
            active: active.as_deref() == Some(p.id.as_str()),
        })
        .collect();
    Json(entries)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    model: Option<String>,
    model_name: Option<String>,
    state: LifecycleState,
    status: String,
}

impl From<LifecycleView> for StatusResponse {
    fn from(view: LifecycleView) -> Self {
        let (model, model_name) = match view.active_model {
            Some(ActiveModel { profile_id, display_name }) => (Some(profile_id), Some(display_name)),
            None => (None, None),
        };
        Self { model, model_name, state: view.state, status: view.status }
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.plane.store.lifecycle().into())
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    lines: Vec<String>,
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogsQuery>) -> Json<LogsResponse> {
    let n = q.tail.unwrap_or(state.plane.config.log_tail);
    Json(LogsResponse { lines: state.plane.store.log_tail(n) })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryResponse {
    gpus: Vec<GpuMetrics>,
    host: HostMetrics,
    container: ContainerMetrics,
    state: LifecycleState,
    status: String,
    active_model: Option<ActiveModel>,
}

async fn telemetry(State(state): State<AppState>) -> Json<TelemetryResponse> {
    let snap = state.plane.store.get();
    Json(TelemetryResponse {
        gpus: snap.gpus,
        host: snap.host,
        container: snap.container,
        state: snap.state,
        status: snap.status,
        active_model: snap.active_model,
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.observe(&state.plane.store.get());
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(target: "api", "metrics encoding failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct SwitchRequest {
    model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchResponse {
    success: bool,
    model: String,
    model_name: String,
    state: LifecycleState,
    status: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

fn error(code: StatusCode, message: impl ToString) -> Response {
    (code, Json(ErrorBody { error: message.to_string(), state: None, status: None })).into_response()
}

/// Starts a switch and waits, bounded, for it to settle. A switch that is
/// still running when the wait ends answers 202 with the current state.
async fn switch(State(state): State<AppState>, body: Result<Json<SwitchRequest>, JsonRejection>) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let plane = &state.plane;
    tracing::info!(target: "api", model = %req.model, "switch requested");

    let handle = match plane.orchestrator.switch_model(&req.model) {
        Ok(handle) => handle,
        Err(e @ ControlError::ProfileNotFound(_)) => return error(StatusCode::NOT_FOUND, e),
        Err(e @ ControlError::AlreadySwitching) => {
            let current = plane.store.lifecycle();
            let body = ErrorBody { error: e.to_string(), state: Some(current.state), status: Some(current.status) };
            return (StatusCode::CONFLICT, Json(body)).into_response();
        }
        Err(e @ ControlError::ShuttingDown) => return error(StatusCode::SERVICE_UNAVAILABLE, e),
        Err(e @ ControlError::ArtifactMissing(_)) => {
            let name = plane.profiles.get(&req.model).map(|p| p.display_name().to_string()).unwrap_or_default();
            let current = plane.store.lifecycle();
            let body = SwitchResponse {
                success: false,
                model: req.model,
                model_name: name,
                state: current.state,
                status: e.to_string(),
            };
            return (StatusCode::OK, Json(body)).into_response();
        }
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let (model, model_name) = (handle.profile_id.clone(), handle.display_name.clone());
    match handle.wait(plane.config.switch_wait()).await {
        Some(outcome) => {
            let body = SwitchResponse {
                success: outcome.succeeded(),
                model: outcome.profile_id,
                model_name: outcome.display_name,
                state: outcome.state,
                status: outcome.status,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        None => {
            let current = plane.store.lifecycle();
            let body = SwitchResponse { success: false, model, model_name, state: current.state, status: current.status };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
    }
}

#[derive(Deserialize, Default)]
struct ShutdownRequest {
    #[serde(default)]
    intent: Option<ExitIntent>,
}

#[derive(Serialize)]
struct ShutdownResponse {
    intent: ExitIntent,
    code: i32,
}

async fn shutdown(State(state): State<AppState>, body: Option<Json<ShutdownRequest>>) -> Response {
    let intent = body.and_then(|Json(req)| req.intent).unwrap_or(ExitIntent::Quit);
    tracing::info!(target: "api", ?intent, "shutdown requested");
    state.plane.request_exit(intent);
    (StatusCode::ACCEPTED, Json(ShutdownResponse { intent, code: intent.exit_code() })).into_response()
}
