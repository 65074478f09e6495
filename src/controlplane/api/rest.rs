//! REST API Handlers
//!
//! Implements the REST API endpoints for pools, nodes, tasks and task
//! errors. Lifecycle operations answer `202 Accepted` with the task id; their
//! result is observable through the task, node and error endpoints.

use crate::controlplane::PoolManager;
use crate::domain::{
    ErrorModel, NodeModel, NodeStatus, PoolSettings, PoolStatus, ProviderKind, TaskModel, TaskName,
};
use crate::error::{Error, ErrorKind};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Pool summary; connection secrets are never returned
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfoResponse {
    pub uuid: String,
    pub name: String,
    pub provider: ProviderKind,
    pub machines_count: u32,
}

impl From<&PoolSettings> for PoolInfoResponse {
    fn from(pool: &PoolSettings) -> Self {
        Self {
            uuid: pool.uuid.clone(),
            name: pool.name.clone(),
            provider: pool.provider.kind,
            machines_count: pool.provider.machine.machines_count,
        }
    }
}

/// Node info; credentials are reduced to the login user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoResponse {
    pub id: u64,
    pub pool_id: String,
    pub status: NodeStatus,
    pub machine_id: Option<String>,
    pub ip: Option<String>,
    pub user: Option<String>,
    pub occupied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NodeModel> for NodeInfoResponse {
    fn from(node: NodeModel) -> Self {
        Self {
            id: node.id,
            pool_id: node.pool_id,
            status: node.status,
            machine_id: node.machine_id,
            ip: node.ip,
            user: node.credentials.map(|c| c.user),
            occupied: node.occupied,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

/// Answer to a scheduled lifecycle operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAcceptedResponse {
    pub task_id: u64,
    pub task: TaskName,
    pub pool_id: String,
}

/// Operator edit of an error record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateErrorRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error returned by handlers, mapped onto a status code by kind
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::BackendOperationFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ApiErrorResponse {
                error: kind.to_string(),
                message: self.0.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<PoolManager>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(manager: Arc<PoolManager>) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            // Pool endpoints
            .route("/v1/pools", get(list_pools).post(register_pool))
            .route("/v1/pools/:pool_id", get(get_pool))
            .route("/v1/pools/:pool_id/status", get(get_status))
            .route("/v1/pools/:pool_id/occupy", post(occupy))
            .route("/v1/pools/:pool_id/tasks", get(list_running_tasks))
            .route("/v1/pools/:pool_id/errors", get(list_task_errors))
            // Node lifecycle endpoints
            .route("/v1/pools/:pool_id/nodes", get(list_nodes).post(create_node))
            .route("/v1/pools/:pool_id/nodes/:node_id", delete(delete_node))
            .route("/v1/pools/:pool_id/nodes/:node_id/bootstrap", post(bootstrap_node))
            .route("/v1/pools/:pool_id/nodes/:node_id/release", post(release_node))
            // Lookup endpoints
            .route("/v1/statuses", get(list_statuses))
            .route("/v1/nodes/:node_id", get(get_node))
            .route("/v1/tasks/:task_id", get(get_task))
            .route(
                "/v1/errors/:error_id",
                get(get_task_error).put(update_task_error).delete(remove_task_error),
            )
            // Health endpoint
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: Arc<PoolManager>,
}

// =============================================================================
// Pool Handlers
// =============================================================================

async fn list_pools(State(state): State<AppState>) -> Json<Vec<PoolInfoResponse>> {
    Json(state.manager.list_pools().iter().map(PoolInfoResponse::from).collect())
}

async fn register_pool(
    State(state): State<AppState>,
    Json(pool): Json<PoolSettings>,
) -> ApiResult<impl IntoResponse> {
    info!("Registering pool {} via API", pool.uuid);
    let info = PoolInfoResponse::from(&pool);
    state.manager.register_pool(pool)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_pool(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<PoolInfoResponse>> {
    let pool = state.manager.require_pool(&pool_id)?;
    Ok(Json(PoolInfoResponse::from(&pool)))
}

async fn get_status(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<PoolStatus>> {
    let pool = state.manager.require_pool(&pool_id)?;
    Ok(Json(state.manager.get_status(&pool).await?))
}

async fn list_statuses(State(state): State<AppState>) -> ApiResult<Json<Vec<PoolStatus>>> {
    Ok(Json(state.manager.list_statuses().await?))
}

async fn occupy(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Response> {
    let pool = state.manager.require_pool(&pool_id)?;
    let response = match state.manager.occupy(&pool).await? {
        Some(node) => (StatusCode::OK, Json(NodeInfoResponse::from(node))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: ErrorKind::NotFound.to_string(),
                message: format!("No idle node in pool {}", pool_id),
                details: None,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

async fn list_running_tasks(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<TaskModel>>> {
    let pool = state.manager.require_pool(&pool_id)?;
    Ok(Json(state.manager.list_running_tasks(&pool).await?))
}

async fn list_task_errors(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<ErrorModel>>> {
    let pool = state.manager.require_pool(&pool_id)?;
    Ok(Json(state.manager.list_task_errors(&pool).await?))
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn list_nodes(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<NodeInfoResponse>>> {
    let pool = state.manager.require_pool(&pool_id)?;
    let nodes = state.manager.list_nodes(&pool).await?;
    Ok(Json(nodes.into_iter().map(NodeInfoResponse::from).collect()))
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<u64>,
) -> ApiResult<Json<NodeInfoResponse>> {
    let node = state
        .manager
        .get_node(node_id)
        .await?
        .ok_or(Error::NodeNotFound { node_id })?;
    Ok(Json(NodeInfoResponse::from(node)))
}

async fn create_node(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let pool = state.manager.require_pool(&pool_id)?;
    let handle = state.manager.create_node(&pool).await?;
    Ok(accepted(handle.task_id(), handle.task(), pool_id))
}

async fn delete_node(
    State(state): State<AppState>,
    Path((pool_id, node_id)): Path<(String, u64)>,
) -> ApiResult<impl IntoResponse> {
    let pool = state.manager.require_pool(&pool_id)?;
    let handle = state.manager.delete_node(&pool, node_id).await?;
    Ok(accepted(handle.task_id(), handle.task(), pool_id))
}

async fn bootstrap_node(
    State(state): State<AppState>,
    Path((pool_id, node_id)): Path<(String, u64)>,
) -> ApiResult<impl IntoResponse> {
    let pool = state.manager.require_pool(&pool_id)?;
    let handle = state.manager.bootstrap_node(&pool, node_id).await?;
    Ok(accepted(handle.task_id(), handle.task(), pool_id))
}

async fn release_node(
    State(state): State<AppState>,
    Path((pool_id, node_id)): Path<(String, u64)>,
) -> ApiResult<Json<NodeInfoResponse>> {
    let pool = state.manager.require_pool(&pool_id)?;
    let node = state.manager.release(&pool, node_id).await?;
    Ok(Json(NodeInfoResponse::from(node)))
}

fn accepted(task_id: u64, task: TaskName, pool_id: String) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(TaskAcceptedResponse {
            task_id,
            task,
            pool_id,
        }),
    )
}

// =============================================================================
// Task / Error Handlers
// =============================================================================

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
) -> ApiResult<Json<TaskModel>> {
    let task = state
        .manager
        .get_task(task_id)
        .await?
        .ok_or(Error::TaskNotFound { task_id })?;
    Ok(Json(task))
}

async fn get_task_error(
    State(state): State<AppState>,
    Path(error_id): Path<u64>,
) -> ApiResult<Json<ErrorModel>> {
    let record = state
        .manager
        .get_task_error(error_id)
        .await?
        .ok_or(Error::ErrorRecordNotFound { error_id })?;
    Ok(Json(record))
}

async fn update_task_error(
    State(state): State<AppState>,
    Path(error_id): Path<u64>,
    Json(request): Json<UpdateErrorRequest>,
) -> ApiResult<Json<ErrorModel>> {
    let mut record = state
        .manager
        .get_task_error(error_id)
        .await?
        .ok_or(Error::ErrorRecordNotFound { error_id })?;

    if let Some(message) = request.message {
        record.message = message;
    }
    if let Some(info) = request.info {
        record.info = info;
    }

    state.manager.update_task_error(record.clone()).await?;
    Ok(Json(record))
}

async fn remove_task_error(
    State(state): State<AppState>,
    Path(error_id): Path<u64>,
) -> ApiResult<StatusCode> {
    if state.manager.remove_task_error(error_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::ErrorRecordNotFound { error_id }.into())
    }
}

// =============================================================================
// Health Handlers
// =============================================================================

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.manager.list_pools().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no pools registered")
    } else {
        (StatusCode::OK, "ready")
    }
}
