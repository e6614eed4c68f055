use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use cloudvps_common::{ErrorKind, Instance, PurchaseRequest};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::lifecycle::{LifecycleController, LifecycleError};
use crate::metrics::{MetricsError, MetricsReader};
use crate::provisioning::ProvisioningWorkflow;
use crate::repository::{InstanceRepository, RepositoryError};

pub struct AppState {
    pub provisioning: Arc<ProvisioningWorkflow>,
    pub lifecycle: Arc<LifecycleController>,
    pub metrics: Arc<MetricsReader>,
    pub repo: Arc<dyn InstanceRepository>,
    /// Cancels in-flight provisioning runs on shutdown.
    pub shutdown: CancellationToken,
    /// Background purchases and bus commands; drained before the process exits.
    pub tasks: TaskTracker,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/purchases", post(purchase))
        .route("/owners/{owner_id}/instances", get(list_owner_instances))
        .route("/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/instances/{id}/start", post(start_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/restart", post(restart_instance))
        .route("/instances/{id}/shutdown", post(shutdown_instance))
        .route("/instances/{id}/backups", post(create_backup).get(list_backups))
        .route("/instances/{id}/restore", post(restore_backup))
        .route("/instances/{id}/metrics", get(instance_metrics))
        .route("/instances/{id}/reconcile", post(reconcile_instance))
        .route("/instances/{id}/console", get(console_access))
        .with_state(state)
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InstanceDeleted | ErrorKind::InstanceProvisioning => StatusCode::CONFLICT,
        ErrorKind::UnknownTemplate => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::TaskTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::HypervisorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Authentication => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            kind,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{} not found", what))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

impl From<MetricsError> for ApiError {
    fn from(e: MetricsError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        ApiError::new(e.kind(), e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Instances as exposed over HTTP: the root password only travels in the
/// welcome notification.
fn public_view(mut inst: Instance) -> Instance {
    inst.root_password = None;
    inst
}

async fn root() -> &'static str {
    "CloudVPS Orchestrator Online"
}

#[derive(Deserialize, Debug, Default)]
struct PurchaseQuery {
    #[serde(default)]
    wait: bool,
}

async fn purchase(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PurchaseQuery>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<Response> {
    if req.quantity == 0 {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "INVALID_REQUEST", "message": "quantity must be at least 1" })),
        )
            .into_response());
    }

    if q.wait {
        let outcome = state.provisioning.purchase(&req, &state.shutdown).await;
        return Ok(Json(outcome).into_response());
    }

    let quantity = req.quantity;
    let owner_id = req.owner_id.clone();
    let st = state.clone();
    state.tasks.spawn(async move {
        st.provisioning.purchase(&req, &st.shutdown).await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "owner_id": owner_id, "quantity": quantity })),
    )
        .into_response())
}

async fn list_owner_instances(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> ApiResult<Json<Vec<Instance>>> {
    let instances = state.repo.list_by_owner(&owner_id).await?;
    Ok(Json(instances.into_iter().map(public_view).collect()))
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    let inst = state
        .repo
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("instance"))?;
    Ok(Json(public_view(inst)))
}

async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(public_view(state.lifecycle.start(id).await?)))
}

async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(public_view(state.lifecycle.stop(id).await?)))
}

async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(public_view(state.lifecycle.restart(id).await?)))
}

async fn shutdown_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(public_view(state.lifecycle.shutdown(id).await?)))
}

async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.lifecycle.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let task = state.lifecycle.create_backup(id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task": task }))).into_response())
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let backups = state.lifecycle.list_backups(id).await?;
    Ok(Json(backups).into_response())
}

#[derive(Deserialize, Debug)]
struct RestoreRequest {
    archive: String,
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RestoreRequest>,
) -> ApiResult<Response> {
    let task = state.lifecycle.restore_backup(id, &req.archive).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task": task }))).into_response())
}

async fn instance_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    match state.metrics.get_metrics(id).await? {
        Some(m) => Ok(Json(m).into_response()),
        None => Err(ApiError::not_found("metrics")),
    }
}

async fn reconcile_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let outcome = state.metrics.reconcile(id).await?;
    Ok(Json(outcome).into_response())
}

async fn console_access(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let access = state.lifecycle.console_access(id).await?;
    Ok(Json(access).into_response())
}
