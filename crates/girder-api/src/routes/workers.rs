//! Worker lifecycle and protocol endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use girder_core::WorkerStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::ws::Event;
use girder_db::{BuildRepo as _, HeartbeatUpdate, RegisterWorker, WorkerRepo as _, WorkerUpdate};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/register", post(register_worker))
        .route("/{id}", get(get_worker).put(update_worker))
        .route("/{id}/heartbeat", post(heartbeat))
        .route("/{id}/drain", post(drain_worker))
        .route("/{id}/builds", get(worker_builds))
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<girder_db::WorkerRecord>>, ApiError> {
    Ok(Json(state.workers.list().await?))
}

async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<girder_db::WorkerRecord>, ApiError> {
    Ok(Json(state.workers.get(id).await?))
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    id: Uuid,
    name: String,
    registered_at: DateTime<Utc>,
    status: String,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorker>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("worker name is required".to_string()));
    }

    let default_max = state.config.max_concurrent_builds_per_worker_default;
    let worker = state.workers.register(req, default_max).await?;

    info!(worker_id = %worker.id, worker_name = %worker.name, "worker registered");
    state.events.publish(Event::WorkerUpdate {
        worker_id: worker.id.to_string(),
        name: worker.name.clone(),
        status: worker.status.clone(),
    });

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: worker.id,
            name: worker.name,
            registered_at: worker.registered_at,
            status: worker.status,
        }),
    ))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatUpdate>,
) -> Result<Json<girder_db::HeartbeatReply>, ApiError> {
    let reply = state.workers.heartbeat(id, req).await?;
    debug!(
        worker_id = %id,
        current_builds = reply.current_builds,
        has_work = reply.has_work,
        "heartbeat received"
    );
    Ok(Json(reply))
}

async fn drain_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.workers.drain(id).await?;
    let worker = state.workers.get(id).await?;
    info!(worker_id = %id, worker_name = %worker.name, "worker set to draining");
    state.events.publish(Event::WorkerUpdate {
        worker_id: id.to_string(),
        name: worker.name,
        status: worker.status,
    });
    Ok(Json(json!({ "status": WorkerStatus::Draining.as_str() })))
}

#[derive(Debug, Deserialize)]
struct UpdateWorkerRequest {
    max_concurrent_builds: Option<i32>,
    labels: Option<serde_json::Value>,
    status: Option<String>,
}

async fn update_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.max_concurrent_builds.is_none() && req.labels.is_none() && req.status.is_none() {
        return Err(ApiError::BadRequest("no updates provided".to_string()));
    }
    if let Some(max) = req.max_concurrent_builds {
        if max <= 0 {
            return Err(ApiError::BadRequest(
                "max_concurrent_builds must be positive".to_string(),
            ));
        }
    }
    let status = req
        .status
        .as_deref()
        .map(str::parse::<WorkerStatus>)
        .transpose()?;

    let update = WorkerUpdate {
        max_concurrent_builds: req.max_concurrent_builds,
        labels: req.labels,
        status,
    };
    state.workers.update(id, update).await?;
    info!(worker_id = %id, "worker updated");
    Ok(Json(json!({ "status": "updated" })))
}

/// FetchAssigned: the builds this worker should be executing, oldest
/// first, with the frozen build config and SCM coordinates attached.
async fn worker_builds(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<girder_db::AssignedBuild>>, ApiError> {
    // 404s for unknown workers rather than returning an empty list.
    state.workers.get(id).await?;
    let builds = state.builds.fetch_assigned(id, 10).await?;
    Ok(Json(builds))
}
