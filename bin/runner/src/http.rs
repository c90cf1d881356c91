//! HTTP intake.
//!
//! Routes:
//! - `POST /webhooks/{workflow_id}/{node_id}`: inbound trigger webhook
//! - `POST /workflows/{workflow_id}/setup`: provision every trigger
//! - `POST /workflows/{workflow_id}/nodes/{node_id}/fire`: manual fire
//! - `POST /executions/{execution_id}/actions/{action}`: resume with an action
//! - `POST /executions/{execution_id}/webhook`: resume with a callback
//! - `POST /executions/{execution_id}/cancel`: cancel
//!
//! Handlers only translate HTTP to engine calls; all state lives in the
//! store.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::{ExecutionId, NodeId, WorkflowId};
use conveyor_engine::{
    ComponentError, EngineError, NodeExecutor, Store, TriggerRuntime, WebhookProvisioner,
    WebhookRequest,
};
use conveyor_workflow::{GraphError, WorkflowError};
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared handler state.
pub struct AppState<S, P> {
    triggers: Arc<TriggerRuntime<S, P>>,
    executor: NodeExecutor<S>,
}

impl<S, P> Clone for AppState<S, P> {
    fn clone(&self) -> Self {
        Self {
            triggers: Arc::clone(&self.triggers),
            executor: self.executor.clone(),
        }
    }
}

impl<S, P> AppState<S, P> {
    /// Creates handler state.
    pub fn new(triggers: Arc<TriggerRuntime<S, P>>, executor: NodeExecutor<S>) -> Self {
        Self { triggers, executor }
    }
}

/// Builds the intake router.
pub fn router<S, P>(state: AppState<S, P>) -> Router
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/{workflow_id}/{node_id}",
            post(trigger_webhook::<S, P>),
        )
        .route("/workflows/{workflow_id}/setup", post(setup_workflow::<S, P>))
        .route(
            "/workflows/{workflow_id}/nodes/{node_id}/fire",
            post(fire_trigger::<S, P>),
        )
        .route(
            "/executions/{execution_id}/actions/{action}",
            post(execution_action::<S, P>),
        )
        .route(
            "/executions/{execution_id}/webhook",
            post(execution_webhook::<S, P>),
        )
        .route(
            "/executions/{execution_id}/cancel",
            post(cancel_execution::<S, P>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Errors returned by intake handlers.
#[derive(Debug)]
pub enum ApiError {
    /// A path segment is not a valid ID.
    InvalidId { details: String },
    /// The request body is not valid JSON.
    InvalidBody { details: String },
    /// The engine rejected the request.
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId { .. } | Self::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            Self::Engine(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Engine(e) => match e {
                EngineError::Workflow(WorkflowError::NotFound { .. })
                | EngineError::Workflow(WorkflowError::Graph {
                    error: GraphError::NodeNotFound { .. },
                    ..
                })
                | EngineError::ExecutionNotFound { .. }
                | EngineError::EventNotFound { .. } => StatusCode::NOT_FOUND,
                EngineError::NotATrigger { .. }
                | EngineError::UnknownTrigger { .. }
                | EngineError::UnknownComponent { .. }
                | EngineError::Component(ComponentError::InvalidConfiguration { .. })
                | EngineError::Component(ComponentError::UnsupportedAction { .. }) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                EngineError::InvalidState { .. } | EngineError::Transition(_) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId { details } => write!(f, "invalid id: {details}"),
            Self::InvalidBody { details } => write!(f, "invalid request body: {details}"),
            Self::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn parse_id<T>(value: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    T::from_str(value).map_err(|e| ApiError::InvalidId {
        details: format!("'{value}': {e}"),
    })
}

/// Parses an optional JSON body; an empty body is `null`.
fn parse_body(body: &[u8]) -> Result<JsonValue, ApiError> {
    if body.is_empty() {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody {
        details: e.to_string(),
    })
}

fn webhook_request(headers: &HeaderMap, body: Bytes) -> WebhookRequest {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .fold(WebhookRequest::new(body.to_vec()), |request, (name, value)| {
            request.with_header(name, value)
        })
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health() -> &'static str {
    "ok"
}

async fn trigger_webhook<S, P>(
    State(state): State<AppState<S, P>>,
    Path((workflow_id, node_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let workflow_id: WorkflowId = parse_id(&workflow_id)?;
    let node_id: NodeId = parse_id(&node_id)?;
    let status = state
        .triggers
        .handle_webhook(workflow_id, node_id, webhook_request(&headers, body))
        .await?;
    Ok(status_code(status))
}

async fn setup_workflow<S, P>(
    State(state): State<AppState<S, P>>,
    Path(workflow_id): Path<String>,
) -> Result<Json<JsonValue>, ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let workflow_id: WorkflowId = parse_id(&workflow_id)?;
    let triggers = state.triggers.setup_workflow(workflow_id).await?;
    Ok(Json(json!({ "triggers": triggers })))
}

async fn fire_trigger<S, P>(
    State(state): State<AppState<S, P>>,
    Path((workflow_id, node_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<JsonValue>), ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let workflow_id: WorkflowId = parse_id(&workflow_id)?;
    let node_id: NodeId = parse_id(&node_id)?;
    let payload = parse_body(&body)?;
    let event = state.triggers.fire(workflow_id, node_id, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event.id.to_string() })),
    ))
}

async fn execution_action<S, P>(
    State(state): State<AppState<S, P>>,
    Path((execution_id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let execution_id: ExecutionId = parse_id(&execution_id)?;
    let parameters = parse_body(&body)?;
    let execution = state
        .executor
        .handle_action(execution_id, &action, parameters)
        .await?;
    Ok(Json(json!({ "state": execution.state.as_str() })))
}

async fn execution_webhook<S, P>(
    State(state): State<AppState<S, P>>,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let execution_id: ExecutionId = parse_id(&execution_id)?;
    let (status, _) = state
        .executor
        .handle_webhook(execution_id, webhook_request(&headers, body))
        .await?;
    Ok(status_code(status))
}

async fn cancel_execution<S, P>(
    State(state): State<AppState<S, P>>,
    Path(execution_id): Path<String>,
) -> Result<Json<JsonValue>, ApiError>
where
    S: Store + 'static,
    P: WebhookProvisioner + 'static,
{
    let execution_id: ExecutionId = parse_id(&execution_id)?;
    let execution = state.executor.cancel(execution_id).await?;
    Ok(Json(json!({ "state": execution.state.as_str() })))
}
