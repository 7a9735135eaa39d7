//! HTTP client for the Girder control plane API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub max_concurrent_builds: i32,
    pub cpu_cores: i32,
    pub memory_mb: i32,
    pub labels: HashMap<String, String>,
    pub capabilities: HashMap<String, bool>,
    pub agent_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredWorker {
    pub id: Uuid,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub current_builds: i32,
    pub health_status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub current_builds: i32,
    pub max_builds: i32,
    pub has_work: bool,
}

/// A build handed to this worker, with the frozen build config and SCM
/// coordinates.
#[derive(Debug, Clone, Deserialize)]
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

/// A status report for one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i32>,
}

/// How the API answered a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The transition was applied.
    Applied,
    /// The build moved on without us; retrying the same report is futile.
    Conflict,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub stream: String,
    pub line: String,
}

#[derive(Debug, Deserialize)]
struct BuildState {
    status: String,
}

#[derive(Serialize)]
struct AppendLogsRequest<'a> {
    lines: &'a [LogLine],
}

/// API client for the agent's side of the worker protocol.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(api_server: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to create HTTP client")?;

        let base_url = if api_server.starts_with("http://") || api_server.starts_with("https://") {
            api_server.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", api_server.trim_end_matches('/'))
        };

        Ok(Self { client, base_url })
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisteredWorker> {
        let url = format!("{}/api/v1/workers/register", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("failed to send registration")?;

        if response.status().is_success() {
            response.json().await.context("failed to parse registration response")
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("registration failed ({status}): {body}")
        }
    }

    pub async fn heartbeat(
        &self,
        worker_id: Uuid,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let url = format!("{}/api/v1/workers/{worker_id}/heartbeat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("failed to send heartbeat")?;

        if response.status().is_success() {
            response.json().await.context("failed to parse heartbeat response")
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("heartbeat failed ({status}): {body}")
        }
    }

    /// Fetch the builds assigned to this worker.
    pub async fn fetch_builds(&self, worker_id: Uuid) -> Result<Vec<AssignedBuild>> {
        let url = format!("{}/api/v1/workers/{worker_id}/builds", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to fetch assigned builds")?;

        if response.status().is_success() {
            response.json().await.context("failed to parse builds response")
        } else {
            let status = response.status();
            anyhow::bail!("fetching builds failed ({status})")
        }
    }

    /// The build's current status, for cancellation observation.
    pub async fn build_status(&self, build_id: Uuid) -> Result<String> {
        let url = format!("{}/api/v1/builds/{build_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to fetch build")?;

        if response.status().is_success() {
            let state: BuildState = response.json().await.context("failed to parse build")?;
            Ok(state.status)
        } else {
            let status = response.status();
            anyhow::bail!("fetching build failed ({status})")
        }
    }

    /// Report a status transition. A 409 means the control plane already
    /// moved the build (cancelled, timed out, or a duplicate report); the
    /// caller decides what to do with that.
    pub async fn report_status(
        &self,
        build_id: Uuid,
        update: &StatusUpdate,
    ) -> Result<ReportOutcome> {
        let url = format!("{}/api/v1/builds/{build_id}/status", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(update)
            .send()
            .await
            .context("failed to send status report")?;

        match response.status() {
            s if s.is_success() => Ok(ReportOutcome::Applied),
            StatusCode::CONFLICT => Ok(ReportOutcome::Conflict),
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("status report failed ({status}): {body}")
            }
        }
    }

    /// Ship a batch of log lines for a build.
    pub async fn append_logs(&self, build_id: Uuid, lines: &[LogLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let url = format!("{}/api/v1/builds/{build_id}/logs", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&AppendLogsRequest { lines })
            .send()
            .await
            .context("failed to ship logs")?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            anyhow::bail!("shipping logs failed ({status})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_a_scheme_when_missing() {
        let client = ApiClient::new("localhost:8080").unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");

        let client = ApiClient::new("https://ci.example.com/").unwrap();
        assert_eq!(client.base_url, "https://ci.example.com");
    }

    #[test]
    fn status_update_omits_empty_fields() {
        let update = StatusUpdate {
            status: "running".to_string(),
            started_at: Some(Utc::now()),
            ..StatusUpdate::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("exit_code").is_none());
        assert!(json.get("completed_at").is_none());
        assert!(json.get("started_at").is_some());
    }
}
