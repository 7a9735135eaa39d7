//! Worker registry repository.
//!
//! Registration is idempotent by worker name, heartbeats carry the live
//! build counter, and the claim/counter helpers here are the primitives
//! every assignment and terminal transition goes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use girder_core::WorkerStatus;
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Wire spellings of the statuses eligible for new assignments, derived
/// from the domain rule rather than spelled out at each query.
pub(crate) fn accepting_statuses() -> Vec<&'static str> {
    WorkerStatus::ALL
        .iter()
        .filter(|status| status.accepts_work())
        .map(|status| status.as_str())
        .collect()
}

/// Statuses a heartbeat must leave untouched.
fn held_statuses() -> Vec<&'static str> {
    WorkerStatus::ALL
        .iter()
        .filter(|status| status.is_held())
        .map(|status| status.as_str())
        .collect()
}

/// Statuses the reaper watches for missed heartbeats.
fn heartbeat_expected_statuses() -> Vec<&'static str> {
    WorkerStatus::ALL
        .iter()
        .filter(|status| status.expects_heartbeat())
        .map(|status| status.as_str())
        .collect()
}

/// A worker record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub max_concurrent_builds: i32,
    pub current_builds: i32,
    pub cpu_cores: i32,
    pub memory_mb: i32,
    pub labels: serde_json::Value,
    pub capabilities: serde_json::Value,
    pub status: String,
    pub health_status: String,
    pub agent_version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload sent by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterWorker {
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub max_concurrent_builds: i32,
    #[serde(default)]
    pub cpu_cores: i32,
    #[serde(default)]
    pub memory_mb: i32,
    #[serde(default = "empty_object")]
    pub labels: serde_json::Value,
    #[serde(default = "empty_object")]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub agent_version: String,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Heartbeat payload sent by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatUpdate {
    #[serde(default)]
    pub current_builds: i32,
    #[serde(default)]
    pub health_status: String,
}

/// Heartbeat response: current capacity plus the advisory work hint.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReply {
    pub status: String,
    pub current_builds: i32,
    pub max_builds: i32,
    pub has_work: bool,
}

/// Partial update of worker configuration.
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    pub max_concurrent_builds: Option<i32>,
    pub labels: Option<serde_json::Value>,
    pub status: Option<WorkerStatus>,
}

/// A worker marked offline by the reaper.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReapedWorker {
    pub id: Uuid,
    pub name: String,
}

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Upsert keyed by name. A duplicate name reactivates the existing row
    /// with refreshed attributes; `registered_at` is preserved.
    async fn register(&self, req: RegisterWorker, default_max: i32) -> DbResult<WorkerRecord>;

    /// Refresh liveness and the live counter. Held statuses (draining,
    /// maintenance) are preserved; anything else is forced back to online.
    async fn heartbeat(&self, id: Uuid, beat: HeartbeatUpdate) -> DbResult<HeartbeatReply>;

    /// Transition to draining. Idempotent.
    async fn drain(&self, id: Uuid) -> DbResult<()>;

    async fn get(&self, id: Uuid) -> DbResult<WorkerRecord>;
    async fn list(&self) -> DbResult<Vec<WorkerRecord>>;
    async fn update(&self, id: Uuid, update: WorkerUpdate) -> DbResult<()>;

    /// Mark workers offline whose last heartbeat is older than the
    /// threshold. With `requeue` set, their running builds go back to the
    /// queue in the same transaction; otherwise the timeout sweep picks
    /// them up later.
    async fn reap_stale(&self, threshold_seconds: i64, requeue: bool)
    -> DbResult<Vec<ReapedWorker>>;
}

/// Select one eligible worker for assignment, locking the row so
/// concurrent schedulers pick disjoint workers. Least-loaded first, oldest
/// heartbeat breaking ties. Returns `None` when no worker qualifies.
pub async fn claim_worker<'e, E>(
    executor: E,
    selector: &serde_json::Value,
) -> sqlx::Result<Option<Uuid>>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar(
        r#"
        SELECT id FROM workers
        WHERE status = ANY($2)
          AND current_builds < max_concurrent_builds
          AND labels @> $1
        ORDER BY current_builds ASC, last_heartbeat ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(selector)
    .bind(accepting_statuses())
    .fetch_optional(executor)
    .await
}

/// Adjust a worker's live build counter, clamped to
/// `[0, max_concurrent_builds]`. Callers run this inside the same
/// transaction as the status flip it accounts for.
pub async fn adjust_current_builds<'e, E>(
    executor: E,
    worker_id: Uuid,
    delta: i32,
) -> sqlx::Result<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE workers
        SET current_builds = GREATEST(LEAST(current_builds + $2, max_concurrent_builds), 0),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(worker_id)
    .bind(delta)
    .execute(executor)
    .await?;
    Ok(())
}

/// PostgreSQL implementation of WorkerRepo.
pub struct PgWorkerRepo {
    pool: PgPool,
}

impl PgWorkerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepo for PgWorkerRepo {
    async fn register(&self, req: RegisterWorker, default_max: i32) -> DbResult<WorkerRecord> {
        let max_builds = if req.max_concurrent_builds > 0 {
            req.max_concurrent_builds
        } else {
            default_max
        };

        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            INSERT INTO workers (
                id, name, hostname, ip_address, max_concurrent_builds,
                cpu_cores, memory_mb, labels, capabilities,
                status, health_status, agent_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'healthy', $11)
            ON CONFLICT (name) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                ip_address = EXCLUDED.ip_address,
                max_concurrent_builds = EXCLUDED.max_concurrent_builds,
                cpu_cores = EXCLUDED.cpu_cores,
                memory_mb = EXCLUDED.memory_mb,
                labels = EXCLUDED.labels,
                capabilities = EXCLUDED.capabilities,
                agent_version = EXCLUDED.agent_version,
                status = EXCLUDED.status,
                last_heartbeat = NOW(),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&req.name)
        .bind(&req.hostname)
        .bind(&req.ip_address)
        .bind(max_builds)
        .bind(req.cpu_cores)
        .bind(req.memory_mb)
        .bind(&req.labels)
        .bind(&req.capabilities)
        .bind(WorkerStatus::Online.as_str())
        .bind(&req.agent_version)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn heartbeat(&self, id: Uuid, beat: HeartbeatUpdate) -> DbResult<HeartbeatReply> {
        let health = if beat.health_status.is_empty() {
            "healthy"
        } else {
            beat.health_status.as_str()
        };

        // The status CASE runs inside the UPDATE so a drain committed
        // between an agent's read and this write cannot be reverted.
        let row: Option<(String, i32, i32)> = sqlx::query_as(
            r#"
            UPDATE workers
            SET last_heartbeat = NOW(),
                current_builds = GREATEST(LEAST($2, max_concurrent_builds), 0),
                health_status = $3,
                status = CASE WHEN status = ANY($4) THEN status ELSE $5 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING status, current_builds, max_concurrent_builds
            "#,
        )
        .bind(id)
        .bind(beat.current_builds)
        .bind(health)
        .bind(held_statuses())
        .bind(WorkerStatus::Online.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let (status, current_builds, max_builds) =
            row.ok_or_else(|| DbError::NotFound(format!("worker {id}")))?;

        let accepting = status
            .parse::<WorkerStatus>()
            .map(|s| s.accepts_work())
            .unwrap_or(false);

        let mut has_work = false;
        if accepting && current_builds < max_builds {
            has_work = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM builds WHERE worker_id = $1 AND status = 'queued')",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        }

        Ok(HeartbeatReply {
            status,
            current_builds,
            max_builds,
            has_work,
        })
    }

    async fn drain(&self, id: Uuid) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE workers SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(WorkerStatus::Draining.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DbResult<WorkerRecord> {
        let record = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {id}")))?;
        Ok(record)
    }

    async fn list(&self) -> DbResult<Vec<WorkerRecord>> {
        let records =
            sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    async fn update(&self, id: Uuid, update: WorkerUpdate) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET max_concurrent_builds = COALESCE($2, max_concurrent_builds),
                labels = COALESCE($3, labels),
                status = COALESCE($4, status),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.max_concurrent_builds)
        .bind(update.labels)
        .bind(update.status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    async fn reap_stale(
        &self,
        threshold_seconds: i64,
        requeue: bool,
    ) -> DbResult<Vec<ReapedWorker>> {
        let mut tx = self.pool.begin().await?;

        let reaped = sqlx::query_as::<_, ReapedWorker>(
            r#"
            UPDATE workers
            SET status = $2, health_status = 'unhealthy', updated_at = NOW()
            WHERE status = ANY($3)
              AND last_heartbeat < NOW() - make_interval(secs => $1)
            RETURNING id, name
            "#,
        )
        .bind(threshold_seconds as f64)
        .bind(WorkerStatus::Offline.as_str())
        .bind(heartbeat_expected_statuses())
        .fetch_all(&mut *tx)
        .await?;

        if requeue && !reaped.is_empty() {
            let ids: Vec<Uuid> = reaped.iter().map(|w| w.id).collect();
            sqlx::query(
                r#"
                WITH requeued AS (
                    UPDATE builds
                    SET status = 'queued', worker_id = NULL, started_at = NULL
                    WHERE worker_id = ANY($1) AND status = 'running'
                    RETURNING worker_id
                )
                UPDATE workers w
                SET current_builds = GREATEST(w.current_builds - r.n, 0)
                FROM (
                    SELECT worker_id, COUNT(*)::INT AS n
                    FROM requeued GROUP BY worker_id
                ) r
                WHERE w.id = r.worker_id
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_sets_follow_the_domain_rules() {
        assert_eq!(accepting_statuses(), vec!["online"]);
        assert_eq!(held_statuses(), vec!["draining", "maintenance"]);
        assert_eq!(heartbeat_expected_statuses(), vec!["online", "draining"]);
    }

    #[test]
    fn status_sets_partition_consistently() {
        // A worker the scheduler can pick must also be one the reaper
        // watches, and never one a heartbeat holds in place.
        for status in WorkerStatus::ALL {
            if status.accepts_work() {
                assert!(status.expects_heartbeat());
                assert!(!status.is_held());
            }
        }
    }
}
