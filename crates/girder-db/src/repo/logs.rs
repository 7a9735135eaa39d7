//! Build log repository.
//!
//! Log lines are append-only with a per-build contiguous sequence number;
//! appends lock the build row so concurrent batches cannot collide on the
//! `(build_id, sequence_number)` unique key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A log line record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildLogRecord {
    pub id: Uuid,
    pub build_id: Uuid,
    pub sequence_number: i32,
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub log_line: String,
}

/// A log line shipped by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogLine {
    #[serde(default = "default_stream")]
    pub stream: String,
    pub line: String,
}

fn default_stream() -> String {
    "stdout".to_string()
}

#[async_trait]
pub trait BuildLogRepo: Send + Sync {
    /// Append a batch of log lines, assigning contiguous sequence numbers
    /// after the current maximum. Returns the number of lines written.
    async fn append_batch(&self, build_id: Uuid, lines: &[NewLogLine]) -> DbResult<usize>;

    /// All log lines for a build in sequence order.
    async fn list(&self, build_id: Uuid) -> DbResult<Vec<BuildLogRecord>>;
}

/// PostgreSQL implementation of BuildLogRepo.
pub struct PgBuildLogRepo {
    pool: PgPool,
}

impl PgBuildLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildLogRepo for PgBuildLogRepo {
    async fn append_batch(&self, build_id: Uuid, lines: &[NewLogLine]) -> DbResult<usize> {
        if lines.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        // Serializes appenders per build and confirms the build exists.
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM builds WHERE id = $1 FOR UPDATE")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(DbError::NotFound(format!("build {build_id}")));
        }

        let base: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM build_logs WHERE build_id = $1",
        )
        .bind(build_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO build_logs (id, build_id, sequence_number, stream, log_line, timestamp) ",
        );
        query_builder.push_values(lines.iter().enumerate(), |mut b, (i, line)| {
            b.push_bind(Uuid::now_v7())
                .push_bind(build_id)
                .push_bind(base + i as i32 + 1)
                .push_bind(&line.stream)
                .push_bind(&line.line)
                .push("NOW()");
        });

        query_builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(lines.len())
    }

    async fn list(&self, build_id: Uuid) -> DbResult<Vec<BuildLogRecord>> {
        let records = sqlx::query_as::<_, BuildLogRecord>(
            r#"
            SELECT id, build_id, sequence_number, timestamp, stream, log_line
            FROM build_logs
            WHERE build_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
