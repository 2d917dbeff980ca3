//! HTTP API
//!
//! - `POST /callbacks/post-installation` - hypervisor finished installing a VM
//! - `POST /callbacks/post-recreate` - hypervisor finished reinstalling a VM
//! - `GET /health`
//! - `GET /api/pool` - free and claimed network configurations per role
//! - `GET /api/services/{id}` - service, its status history and VM
//! - `POST /api/vms/{id}/power` - queue a power button press, body `{"state": "on"|"off"}`
//! - `POST /api/vms/{id}/reset` - queue a reset
//! - `POST /api/vms/{id}/recreate` - queue a reinstall
//! - `DELETE /api/vms/{id}` - queue deletion
//!
//! Operator endpoints only enqueue work and answer `202` with the task id.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::Error;
use crate::guard::PowerState;
use crate::lifecycle::{CallbackOutcome, Orchestrator};
use crate::models::{Service, ServiceStatus, VirtualMachine};
use crate::platform::Platform;
use crate::pool::PoolStats;
use crate::tasks::TaskPayload;

type ApiResult<T> = Result<T, (StatusCode, String)>;

pub struct AppState<P: Platform> {
    orchestrator: Arc<Orchestrator<P>>,
}

impl<P: Platform> AppState<P> {
    pub fn new(orchestrator: Arc<Orchestrator<P>>) -> Self {
        Self { orchestrator }
    }
}

impl<P: Platform> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::Unauthorized { .. } => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: Error) -> (StatusCode, String) {
    let status = status_of(&error);
    if status.is_server_error() {
        error!(error = %error, "Request failed");
    }
    (status, error.to_string())
}

// ─── Callbacks ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    vm_id: i64,
    secret: String,
    /// Reported by the hypervisor, not used
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    outcome: CallbackOutcome,
}

async fn post_installation<P: Platform>(
    State(state): State<AppState<P>>,
    Json(req): Json<CallbackRequest>,
) -> ApiResult<Json<CallbackResponse>> {
    let outcome = state
        .orchestrator
        .post_installation(req.vm_id, &req.secret)
        .await
        .map_err(reject)?;
    Ok(Json(CallbackResponse { outcome }))
}

async fn post_recreate<P: Platform>(
    State(state): State<AppState<P>>,
    Json(req): Json<CallbackRequest>,
) -> ApiResult<Json<CallbackResponse>> {
    let outcome = state
        .orchestrator
        .post_recreate(req.vm_id, &req.secret)
        .await
        .map_err(reject)?;
    Ok(Json(CallbackResponse { outcome }))
}

// ─── Operator ─────────────────────────────────────────────────────────────

async fn pool_stats<P: Platform>(State(state): State<AppState<P>>) -> ApiResult<Json<Vec<PoolStats>>> {
    let stats = state
        .orchestrator
        .pool()
        .stats()
        .await
        .map_err(reject)?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
pub struct ServiceDetails {
    #[serde(flatten)]
    service: Service,
    history: Vec<ServiceStatus>,
    vm: Option<VirtualMachine>,
}

async fn get_service<P: Platform>(
    State(state): State<AppState<P>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ServiceDetails>> {
    let store = state.orchestrator.store();
    let service = state
        .orchestrator
        .require_service(id)
        .await
        .map_err(reject)?;
    let history = store
        .status_history(id)
        .await
        .map_err(|e| reject(e.into()))?;
    let vm = store
        .vm_for_service(id)
        .await
        .map_err(|e| reject(e.into()))?;

    Ok(Json(ServiceDetails {
        service,
        history,
        vm,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    state: PowerState,
}

#[derive(Debug, Serialize)]
pub struct Queued {
    task_id: i64,
}

async fn enqueue_for_vm<P: Platform>(
    state: &AppState<P>,
    vm_id: i64,
    payload: TaskPayload,
) -> ApiResult<(StatusCode, Json<Queued>)> {
    state
        .orchestrator
        .require_vm(vm_id)
        .await
        .map_err(reject)?;
    let task_id = state
        .orchestrator
        .tasks()
        .enqueue(&payload)
        .await
        .map_err(|e| reject(e.into()))?;

    info!(vm_id, task_id, kind = payload.kind(), "Operator request queued");
    Ok((StatusCode::ACCEPTED, Json(Queued { task_id })))
}

async fn power<P: Platform>(
    State(state): State<AppState<P>>,
    Path(vm_id): Path<i64>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<(StatusCode, Json<Queued>)> {
    enqueue_for_vm(
        &state,
        vm_id,
        TaskPayload::Power {
            vm_id,
            state: req.state,
        },
    )
    .await
}

async fn reset<P: Platform>(
    State(state): State<AppState<P>>,
    Path(vm_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Queued>)> {
    enqueue_for_vm(&state, vm_id, TaskPayload::Reset { vm_id }).await
}

async fn recreate<P: Platform>(
    State(state): State<AppState<P>>,
    Path(vm_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Queued>)> {
    enqueue_for_vm(&state, vm_id, TaskPayload::Recreate { vm_id }).await
}

async fn destroy<P: Platform>(
    State(state): State<AppState<P>>,
    Path(vm_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Queued>)> {
    enqueue_for_vm(&state, vm_id, TaskPayload::Destroy { vm_id }).await
}

pub fn routes<P: Platform>(state: AppState<P>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/callbacks/post-installation", post(post_installation::<P>))
        .route("/callbacks/post-recreate", post(post_recreate::<P>))
        .route("/api/pool", get(pool_stats::<P>))
        .route("/api/services/{id}", get(get_service::<P>))
        .route("/api/vms/{id}", axum::routing::delete(destroy::<P>))
        .route("/api/vms/{id}/power", post(power::<P>))
        .route("/api/vms/{id}/reset", post(reset::<P>))
        .route("/api/vms/{id}/recreate", post(recreate::<P>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
