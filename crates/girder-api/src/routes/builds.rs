//! Build endpoints: listing, status reports, cancellation, logs.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use girder_core::BuildStatus;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::ws::Event;
use girder_db::{
    BuildFilter, BuildLogRepo as _, BuildRecord, BuildRepo as _, NewLogLine, StatusReport,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_builds))
        .route("/{id}", get(get_build))
        .route("/{id}/status", put(report_status))
        .route("/{id}/cancel", post(cancel_build))
        .route("/{id}/logs", get(get_build_logs).post(append_build_logs))
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    job_id: Option<Uuid>,
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<BuildRecord>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<BuildStatus>)
        .transpose()?;
    let filter = BuildFilter {
        job_id: query.job_id,
        status,
        limit: query.limit.unwrap_or(50),
    };
    Ok(Json(state.builds.list(filter).await?))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildRecord>, ApiError> {
    Ok(Json(state.builds.get(id).await?))
}

#[derive(Debug, Deserialize)]
struct ReportStatusRequest {
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    duration_seconds: Option<i32>,
}

/// ReportStatus: a worker's state transition for one build, applied as a
/// compare-and-swap on the prior status. Out-of-order or duplicate
/// reports come back as 409, never silently applied.
async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportStatusRequest>,
) -> Result<Json<BuildRecord>, ApiError> {
    let target: BuildStatus = req.status.parse()?;
    let expected = BuildStatus::required_prior(target)?;

    let report = StatusReport {
        started_at: req.started_at,
        completed_at: req.completed_at,
        exit_code: req.exit_code,
        error_message: req.error_message,
        duration_seconds: req.duration_seconds,
    };

    let build = state
        .builds
        .update_status_checked(id, expected, target, report)
        .await?;

    info!(build_id = %id, status = %target, "build status updated");
    state.events.publish(Event::BuildUpdate {
        build_id: build.id.to_string(),
        job_id: build.job_id.to_string(),
        status: build.status.clone(),
    });

    Ok(Json(build))
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildRecord>, ApiError> {
    let build = state.builds.cancel(id).await?;

    info!(build_id = %id, "build cancelled");
    state.events.publish(Event::BuildUpdate {
        build_id: build.id.to_string(),
        job_id: build.job_id.to_string(),
        status: build.status.clone(),
    });

    Ok(Json(build))
}

async fn get_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<girder_db::BuildLogRecord>>, ApiError> {
    Ok(Json(state.logs.list(id).await?))
}

#[derive(Debug, Deserialize)]
struct AppendLogsRequest {
    lines: Vec<NewLogLine>,
}

async fn append_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AppendLogsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let appended = state.logs.append_batch(id, &req.lines).await?;
    Ok(Json(json!({ "appended": appended })))
}
