//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, DbResult};

/// A job record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub scm_type: String,
    pub scm_url: String,
    pub scm_branch: String,
    pub build_config: serde_json::Value,
    pub environment_vars: serde_json::Value,
    pub worker_labels: serde_json::Value,
    pub enabled: bool,
    pub timeout_minutes: i32,
    pub max_retries: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or replacing a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_scm_type")]
    pub scm_type: String,
    #[serde(default)]
    pub scm_url: String,
    #[serde(default = "default_branch")]
    pub scm_branch: String,
    #[serde(default = "empty_object")]
    pub build_config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub environment_vars: serde_json::Value,
    #[serde(default = "empty_object")]
    pub worker_labels: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: i32,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default)]
    pub created_by: String,
}

fn default_scm_type() -> String {
    "git".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> i32 {
    60
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, job: NewJob) -> DbResult<JobRecord>;
    async fn get(&self, id: Uuid) -> DbResult<JobRecord>;
    async fn list(&self) -> DbResult<Vec<JobRecord>>;
    async fn update(&self, id: Uuid, job: NewJob) -> DbResult<JobRecord>;
    async fn delete(&self, id: Uuid) -> DbResult<()>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn create(&self, job: NewJob) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (
                id, name, description, scm_type, scm_url, scm_branch,
                build_config, environment_vars, worker_labels, enabled,
                timeout_minutes, max_retries, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.scm_type)
        .bind(&job.scm_url)
        .bind(&job.scm_branch)
        .bind(&job.build_config)
        .bind(&job.environment_vars)
        .bind(&job.worker_labels)
        .bind(job.enabled)
        .bind(job.timeout_minutes)
        .bind(job.max_retries)
        .bind(&job.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {}", job.name))
            }
            _ => DbError::Database(e),
        })?;
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Ok(record)
    }

    async fn list(&self) -> DbResult<Vec<JobRecord>> {
        let records =
            sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    async fn update(&self, id: Uuid, job: NewJob) -> DbResult<JobRecord> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET name = $2, description = $3, scm_type = $4, scm_url = $5,
                scm_branch = $6, build_config = $7, environment_vars = $8,
                worker_labels = $9, enabled = $10, timeout_minutes = $11,
                max_retries = $12, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.scm_type)
        .bind(&job.scm_url)
        .bind(&job.scm_branch)
        .bind(&job.build_config)
        .bind(&job.environment_vars)
        .bind(&job.worker_labels)
        .bind(job.enabled)
        .bind(job.timeout_minutes)
        .bind(job.max_retries)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {id}")));
        }
        Ok(())
    }
}
