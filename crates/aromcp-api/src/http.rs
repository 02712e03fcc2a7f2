//! JSON API over the engine.
//!
//! Thin axum adapters around `WorkflowEngine`: every §-public method maps
//! to one route. Payloads are the wire types from `aromcp-types`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use aromcp_core::engine::{EngineError, WorkflowEngine};
use aromcp_types::workflow::StateUpdate;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

/// Build the API router.
pub fn router(engine: Arc<WorkflowEngine>) -> Router {
    Router::new()
        .route("/api/v1/workflows", get(list_workflows))
        .route("/api/v1/workflows/{name}", get(get_info))
        .route("/api/v1/workflows/{name}/start", post(start))
        .route("/api/v1/instances/{id}/next", get(get_next_step))
        .route("/api/v1/instances/{id}/complete", post(step_complete))
        .route("/api/v1/instances/{id}/state", post(update_state))
        .route("/api/v1/instances/{id}/pause", post(pause))
        .route("/api/v1/instances/{id}/resume", post(resume))
        .route("/api/v1/instances/{id}/cancel", post(cancel))
        .route("/api/v1/instances/{id}/status", get(status))
        .route("/api/v1/instances/{id}/sub_agents", get(list_sub_agents))
        .with_state(AppState { engine })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(StatusCode, String);

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::UnknownWorkflow(_)
            | EngineError::UnknownInstance(_)
            | EngineError::UnknownSubAgent(_) => StatusCode::NOT_FOUND,
            EngineError::InvalidInputs(_) | EngineError::Definition(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::IllegalTransition { .. } => StatusCode::CONFLICT,
            EngineError::State(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError(code, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_workflows(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.list_workflows()))
}

async fn get_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.engine.get_info(&name) {
        Some(info) => Ok(Json(json!(info))),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("unknown workflow '{name}'"),
        )),
    }
}

#[derive(Deserialize, Default)]
struct StartBody {
    #[serde(default)]
    inputs: serde_json::Map<String, Value>,
}

async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StartBody>>,
) -> Result<Json<Value>, ApiError> {
    let inputs = body.map(|Json(b)| b.inputs).unwrap_or_default();
    let id = state.engine.start(&name, inputs)?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize, Default)]
struct TaskQuery {
    task_id: Option<String>,
}

async fn get_next_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let step = state
        .engine
        .get_next_step(&id, query.task_id.as_deref())
        .await?;
    Ok(Json(json!({ "step": step })))
}

#[derive(Deserialize)]
struct CompleteBody {
    step_id: String,
    #[serde(default)]
    result: Value,
    task_id: Option<String>,
}

async fn step_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<Value>, ApiError> {
    let accepted = state
        .engine
        .step_complete(&id, &body.step_id, body.result, body.task_id.as_deref())
        .await?;
    Ok(Json(json!({ "accepted": accepted })))
}

#[derive(Deserialize)]
struct UpdateBody {
    updates: Vec<StateUpdate>,
}

async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, ApiError> {
    let view = state.engine.update_state(&id, &body.updates).await?;
    Ok(Json(Value::Object(view)))
}

async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.engine.pause(&id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.engine.resume(&id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.engine.cancel(&id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.engine.status(&id).await?;
    Ok(Json(json!(record)))
}

async fn list_sub_agents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let summaries = state.engine.list_sub_agents(&id).await?;
    Ok(Json(json!(summaries)))
}
