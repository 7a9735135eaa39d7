//! Build repository.
//!
//! Builds move through their state machine exclusively via conditional
//! updates here; every transition that changes a worker's load adjusts the
//! `current_builds` counter in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use girder_core::BuildStatus;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repo::job::JobRecord;
use crate::repo::worker::{accepting_statuses, adjust_current_builds, claim_worker};
use crate::{DbError, DbResult};

/// A build record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub build_number: i32,
    pub status: String,
    pub worker_id: Option<Uuid>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub exit_code: Option<i32>,
    pub error_message: String,
    pub scm_commit_sha: String,
    pub scm_commit_message: String,
    pub scm_author: String,
    pub branch: String,
    pub build_config: serde_json::Value,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
}

/// A queued build joined with the job's SCM coordinates and the frozen
/// build config, as served to the owning agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssignedBuild {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_name: String,
    pub build_number: i32,
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub scm_type: String,
    pub scm_url: String,
    pub branch: String,
    pub scm_commit_sha: String,
    pub build_config: serde_json::Value,
    pub triggered_by: String,
}

/// A queued build as seen by the scheduler sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedBuild {
    pub id: Uuid,
    pub job_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub worker_labels: serde_json::Value,
}

/// A running build that exceeded its job's timeout.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OverdueBuild {
    pub id: Uuid,
    pub job_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub timeout_minutes: i32,
}

/// Trigger payload for a new build.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerBuild {
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub triggered_by: String,
    /// Pre-assign the build to a specific worker; the scheduler then only
    /// validates capacity instead of claiming.
    pub worker_id: Option<Uuid>,
}

/// Optional fields accompanying a status report.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<i32>,
}

/// Filters for listing builds.
#[derive(Debug, Clone, Default)]
pub struct BuildFilter {
    pub job_id: Option<Uuid>,
    pub status: Option<BuildStatus>,
    pub limit: i64,
}

/// Outcome of one scheduler assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The build is now running on this worker.
    Assigned(Uuid),
    /// No eligible worker; the build stays queued for the next tick.
    NoWorker,
    /// Another scheduler instance moved the build first.
    Lost,
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Create a queued build for a job, with a per-job monotonic build
    /// number and a frozen copy of the job's build config.
    async fn create(&self, job: &JobRecord, trigger: TriggerBuild) -> DbResult<BuildRecord>;

    async fn get(&self, id: Uuid) -> DbResult<BuildRecord>;
    async fn list(&self, filter: BuildFilter) -> DbResult<Vec<BuildRecord>>;

    /// Builds assigned to a worker that still need execution (queued or
    /// scheduler-started), FIFO, for the agent to pick up.
    async fn fetch_assigned(&self, worker_id: Uuid, limit: i64) -> DbResult<Vec<AssignedBuild>>;

    /// The scheduler's sweep page: oldest queued builds first.
    async fn queued_page(&self, limit: i64) -> DbResult<Vec<QueuedBuild>>;

    /// Assign one queued build to an eligible worker: claim (or validate a
    /// pre-assigned worker), CAS the build to running, bump the counter.
    /// All in one transaction; a lost CAS rolls everything back.
    async fn assign(&self, build: &QueuedBuild) -> DbResult<AssignOutcome>;

    /// Conditional status update: applied only when the build's current
    /// status matches `from`, otherwise `Conflict`. Side effects (counter,
    /// timestamps, duration) ride in the same transaction.
    async fn update_status_checked(
        &self,
        id: Uuid,
        from: BuildStatus,
        to: BuildStatus,
        report: StatusReport,
    ) -> DbResult<BuildRecord>;

    /// Cancel a queued or running build.
    async fn cancel(&self, id: Uuid) -> DbResult<BuildRecord>;

    /// Running builds that exceeded their job's `timeout_minutes`.
    async fn list_overdue_running(&self) -> DbResult<Vec<OverdueBuild>>;
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish a stale CAS from a missing row after an update matched
    /// zero rows.
    async fn conflict_or_missing(&self, id: Uuid, expected: BuildStatus) -> DbError {
        let found: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM builds WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        match found {
            Ok(Some(actual)) if actual == expected.as_str() => {
                DbError::Conflict(format!("build {id} has no worker assigned"))
            }
            Ok(Some(actual)) => {
                DbError::Conflict(format!("build {id} is {actual}, expected {expected}"))
            }
            Ok(None) => DbError::NotFound(format!("build {id}")),
            Err(e) => DbError::Database(e),
        }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create(&self, job: &JobRecord, trigger: TriggerBuild) -> DbResult<BuildRecord> {
        let branch = trigger.branch.unwrap_or_else(|| job.scm_branch.clone());
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (
                id, job_id, build_number, status, worker_id, branch,
                scm_commit_sha, scm_commit_message, scm_author,
                build_config, triggered_by
            )
            VALUES (
                $1, $2,
                (SELECT COALESCE(MAX(build_number), 0) + 1 FROM builds WHERE job_id = $2),
                'queued', $3, $4, $5, $6, $7, $8, $9
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.id)
        .bind(trigger.worker_id)
        .bind(&branch)
        .bind(&trigger.commit_sha)
        .bind(&trigger.commit_message)
        .bind(&trigger.author)
        .bind(&job.build_config)
        .bind(&trigger.triggered_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> DbResult<BuildRecord> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        Ok(record)
    }

    async fn list(&self, filter: BuildFilter) -> DbResult<Vec<BuildRecord>> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let records = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT * FROM builds
            WHERE ($1::uuid IS NULL OR job_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY queued_at DESC
            LIMIT $3
            "#,
        )
        .bind(filter.job_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn fetch_assigned(&self, worker_id: Uuid, limit: i64) -> DbResult<Vec<AssignedBuild>> {
        // Running builds are included because the scheduler flips a build
        // to running when it claims a worker; the owning agent still has
        // to pick the build up on its next poll. The row carries its
        // status so the agent knows whether a running report is due.
        let records = sqlx::query_as::<_, AssignedBuild>(
            r#"
            SELECT b.id, b.job_id, j.name AS job_name, b.build_number, b.status,
                   b.queued_at, j.scm_type, j.scm_url, b.branch, b.scm_commit_sha,
                   b.build_config, b.triggered_by
            FROM builds b
            JOIN jobs j ON j.id = b.job_id
            WHERE b.worker_id = $1 AND b.status IN ('queued', 'running')
            ORDER BY b.queued_at ASC
            LIMIT $2
            "#,
        )
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn queued_page(&self, limit: i64) -> DbResult<Vec<QueuedBuild>> {
        let records = sqlx::query_as::<_, QueuedBuild>(
            r#"
            SELECT b.id, b.job_id, b.worker_id, j.worker_labels
            FROM builds b
            JOIN jobs j ON j.id = b.job_id
            WHERE b.status = 'queued'
            ORDER BY b.queued_at ASC, b.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn assign(&self, build: &QueuedBuild) -> DbResult<AssignOutcome> {
        let mut tx = self.pool.begin().await?;

        let worker_id = match build.worker_id {
            // Pre-assigned: the named worker just has to be eligible with
            // spare capacity.
            Some(preassigned) => {
                let eligible: Option<Uuid> = sqlx::query_scalar(
                    r#"
                    SELECT id FROM workers
                    WHERE id = $1
                      AND status = ANY($2)
                      AND current_builds < max_concurrent_builds
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(preassigned)
                .bind(accepting_statuses())
                .fetch_optional(&mut *tx)
                .await?;
                match eligible {
                    Some(id) => id,
                    None => return Ok(AssignOutcome::NoWorker),
                }
            }
            None => {
                let selector = if build.worker_labels.is_object() {
                    build.worker_labels.clone()
                } else {
                    serde_json::json!({})
                };
                match claim_worker(&mut *tx, &selector).await? {
                    Some(id) => id,
                    None => return Ok(AssignOutcome::NoWorker),
                }
            }
        };

        let result = sqlx::query(
            r#"
            UPDATE builds
            SET worker_id = $1, status = 'running', started_at = NOW()
            WHERE id = $2
              AND status = 'queued'
              AND worker_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(worker_id)
        .bind(build.id)
        .bind(build.worker_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race to another scheduler; dropping the transaction
            // releases the claimed worker untouched.
            return Ok(AssignOutcome::Lost);
        }

        adjust_current_builds(&mut *tx, worker_id, 1).await?;
        tx.commit().await?;
        Ok(AssignOutcome::Assigned(worker_id))
    }

    async fn update_status_checked(
        &self,
        id: Uuid,
        from: BuildStatus,
        to: BuildStatus,
        report: StatusReport,
    ) -> DbResult<BuildRecord> {
        let mut tx = self.pool.begin().await?;

        let record: Option<BuildRecord> = if to == BuildStatus::Running {
            sqlx::query_as(
                r#"
                UPDATE builds
                SET status = 'running',
                    started_at = COALESCE(started_at, $3, NOW())
                WHERE id = $1 AND status = $2 AND worker_id IS NOT NULL
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(from.as_str())
            .bind(report.started_at)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            sqlx::query_as(
                r#"
                UPDATE builds
                SET status = $3,
                    started_at = COALESCE(started_at, $4),
                    completed_at = COALESCE($5, NOW()),
                    exit_code = COALESCE($6, exit_code),
                    error_message = COALESCE($7, error_message),
                    duration_seconds = COALESCE(
                        $8,
                        EXTRACT(EPOCH FROM (COALESCE($5, NOW()) - started_at))::INT
                    )
                WHERE id = $1 AND status = $2
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(report.started_at)
            .bind(report.completed_at)
            .bind(report.exit_code)
            .bind(report.error_message)
            .bind(report.duration_seconds)
            .fetch_optional(&mut *tx)
            .await?
        };

        let Some(record) = record else {
            drop(tx);
            return Err(self.conflict_or_missing(id, from).await);
        };

        if let Some(worker_id) = record.worker_id {
            if to == BuildStatus::Running {
                adjust_current_builds(&mut *tx, worker_id, 1).await?;
            } else if to.is_terminal() && from == BuildStatus::Running {
                adjust_current_builds(&mut *tx, worker_id, -1).await?;
            }
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn cancel(&self, id: Uuid) -> DbResult<BuildRecord> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status,) = current.ok_or_else(|| DbError::NotFound(format!("build {id}")))?;

        let was_running = match status.as_str() {
            "queued" => false,
            "running" => true,
            other => {
                return Err(DbError::Conflict(format!(
                    "build {id} is {other} and cannot be cancelled"
                )));
            }
        };

        let record: BuildRecord = sqlx::query_as(
            r#"
            UPDATE builds
            SET status = 'cancelled',
                completed_at = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - started_at))::INT
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&status)
        .fetch_one(&mut *tx)
        .await?;

        if was_running {
            if let Some(worker_id) = record.worker_id {
                adjust_current_builds(&mut *tx, worker_id, -1).await?;
            }
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn list_overdue_running(&self) -> DbResult<Vec<OverdueBuild>> {
        let records = sqlx::query_as::<_, OverdueBuild>(
            r#"
            SELECT b.id, b.job_id, b.worker_id, j.timeout_minutes
            FROM builds b
            JOIN jobs j ON j.id = b.job_id
            WHERE b.status = 'running'
              AND j.timeout_minutes > 0
              AND b.started_at < NOW() - make_interval(mins => j.timeout_minutes)
            ORDER BY b.started_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
