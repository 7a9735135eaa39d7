//! Job management endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::ws::Event;
use girder_db::{BuildRecord, BuildRepo as _, JobRecord, JobRepo as _, NewJob, TriggerBuild};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/{id}/trigger", post(trigger_job))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobRecord>>, ApiError> {
    Ok(Json(state.jobs.list().await?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.jobs.get(id).await?))
}

async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<NewJob>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("job name is required".to_string()));
    }
    let job = state.jobs.create(req).await?;
    info!(job_id = %job.id, job_name = %job.name, "job created");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<NewJob>,
) -> Result<Json<JobRecord>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("job name is required".to_string()));
    }
    let job = state.jobs.update(id, req).await?;
    info!(job_id = %id, "job updated");
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.jobs.delete(id).await?;
    info!(job_id = %id, "job deleted");
    Ok(Json(json!({ "status": "deleted" })))
}

/// Trigger: create a queued build for this job. The job's build config is
/// frozen onto the build row so later job edits do not affect it.
async fn trigger_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<TriggerBuild>>,
) -> Result<(StatusCode, Json<BuildRecord>), ApiError> {
    let job = state.jobs.get(id).await?;
    if !job.enabled {
        return Err(ApiError::Conflict(format!("job {} is disabled", job.name)));
    }

    let mut trigger = body.map(|Json(t)| t).unwrap_or_default();
    if trigger.triggered_by.is_empty() {
        trigger.triggered_by = "manual".to_string();
    }

    let build = state.builds.create(&job, trigger).await?;
    info!(
        job_id = %id,
        build_id = %build.id,
        build_number = build.build_number,
        "build queued"
    );
    state.events.publish(Event::BuildUpdate {
        build_id: build.id.to_string(),
        job_id: build.job_id.to_string(),
        status: build.status.clone(),
    });

    Ok((StatusCode::CREATED, Json(build)))
}
