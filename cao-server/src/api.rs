//! HTTP control plane.
//!
//! Thin validation layer over the orchestrator: handlers pull fields out of
//! JSON bodies, translate `OrchestratorError` into `{kind, message,
//! terminal_id?}` envelopes, and otherwise stay out of the way. Handoff
//! responses block until the callee finishes; axum imposes no idle cutoff of
//! its own.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ErrorKind, OrchestratorError},
    flow::FlowStore,
    orchestrator::{AssignRequest, CreateTerminalRequest, HandoffRequest, Orchestrator, OutputMode},
    registry::MessageKind,
    scheduler::FlowScheduler,
};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub flows: Arc<FlowStore>,
    pub scheduler: Arc<FlowScheduler>,
}

pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition => StatusCode::CONFLICT,
            ErrorKind::DeadRecipient => StatusCode::GONE,
            ErrorKind::LaunchFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::MuxUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ScriptFailure | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(target = "cao::api", kind = %self.0.kind, message = %self.0.message, "request failed");
        }
        let body = json!({
            "kind": self.0.kind,
            "message": self.0.message,
            "terminal_id": self.0.terminal_id,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn required_str(body: &Value, field: &str) -> ApiResult<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            OrchestratorError::invalid_request(format!("missing required field: {field}")).into()
        })
}

fn optional_str(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn parse_provider(body: &Value) -> ApiResult<Option<crate::provider::ProviderKind>> {
    optional_str(body, "provider")
        .map(|p| p.parse())
        .transpose()
        .map_err(|e: String| OrchestratorError::invalid_request(e).into())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/terminals", routing::post(create_terminal).get(list_terminals))
        .route(
            "/terminals/{id}",
            routing::get(get_terminal).delete(delete_terminal),
        )
        .route("/terminals/{id}/output", routing::get(terminal_output))
        .route("/terminals/{id}/messages", routing::post(post_message))
        .route("/orchestrate/handoff", routing::post(handoff))
        .route("/orchestrate/assign", routing::post(assign))
        .route("/flows", routing::post(add_flow).get(list_flows))
        .route(
            "/flows/{name}",
            routing::get(get_flow).patch(patch_flow).delete(delete_flow),
        )
        .route("/flows/{name}/run", routing::post(run_flow))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "cao-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_terminal(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let agent_profile = required_str(&body, "agent")?;
    let provider = parse_provider(&body)?;
    let terminal = state
        .orchestrator
        .create_terminal(CreateTerminalRequest {
            agent_profile,
            provider,
            cwd: optional_str(&body, "cwd"),
            parent_id: optional_str(&body, "parent_id"),
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": terminal.id,
            "session_name": terminal.session_name,
            "status": terminal.status,
        })),
    ))
}

async fn list_terminals(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.orchestrator.registry().list()))
}

async fn get_terminal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let terminal = state.orchestrator.registry().get(&id)?;
    Ok(Json(json!(terminal)))
}

async fn delete_terminal(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.shutdown_terminal(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    mode: Option<OutputMode>,
}

async fn terminal_output(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<Json<Value>> {
    let mode = query.mode.unwrap_or(OutputMode::Full);
    let output = state.orchestrator.output(&id, mode).await?;
    Ok(Json(json!({ "output": output, "mode": mode })))
}

async fn post_message(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let from_id = required_str(&body, "from_id")?;
    let text = required_str(&body, "body")?;
    let kind = match optional_str(&body, "kind").as_deref() {
        None | Some("user") => MessageKind::User,
        Some("system") => MessageKind::System,
        Some("result") => MessageKind::Result,
        Some(other) => {
            return Err(OrchestratorError::invalid_request(format!(
                "unknown message kind '{other}'"
            ))
            .into())
        }
    };
    let outcome = state
        .orchestrator
        .send_message(&from_id, &id, &text, kind)
        .await?;
    Ok(Json(json!({ "result": outcome })))
}

async fn handoff(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .orchestrator
        .handoff(HandoffRequest {
            from_id: optional_str(&body, "from_id"),
            agent_profile: required_str(&body, "agent")?,
            provider: parse_provider(&body)?,
            body: required_str(&body, "body")?,
            cwd: optional_str(&body, "cwd"),
        })
        .await?;
    Ok(Json(json!({
        "terminal_id": outcome.terminal_id,
        "output": outcome.output,
        "status": outcome.status,
    })))
}

async fn assign(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let terminal = state
        .orchestrator
        .assign(AssignRequest {
            from_id: optional_str(&body, "from_id"),
            agent_profile: required_str(&body, "agent")?,
            provider: parse_provider(&body)?,
            body: required_str(&body, "body")?,
            cwd: optional_str(&body, "cwd"),
            callback: optional_str(&body, "callback"),
        })
        .await?;
    Ok(Json(json!({ "terminal_id": terminal.id })))
}

async fn add_flow(State(state): State<ApiState>, body: String) -> ApiResult<Json<Value>> {
    let name = state
        .flows
        .add(&body)
        .map_err(OrchestratorError::from)?;
    Ok(Json(json!({ "name": name })))
}

async fn list_flows(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.flows.list()))
}

async fn get_flow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<String> {
    Ok(state.flows.raw(&name)?)
}

async fn patch_flow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    if let Some(enabled) = body.get("enabled").and_then(Value::as_bool) {
        state.flows.set_enabled(&name, enabled)?;
    } else {
        // Nothing to change, but the flow must exist.
        state.flows.get(&name)?;
    }
    Ok(Json(json!({ "ok": true })))
}

async fn delete_flow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.flows.remove(&name)?;
    Ok(Json(json!({ "ok": true })))
}

async fn run_flow(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let terminal_id = state.scheduler.fire(&name).await?;
    Ok(Json(json!({ "terminal_id": terminal_id })))
}
