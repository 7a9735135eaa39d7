//! Build execution backends.
//!
//! An executor runs one build to completion inside its isolation boundary
//! (a container or a local process tree) and hands back the outcome with
//! the captured output. Failures to even start the build surface as
//! errors; a build that ran and failed is a normal outcome with a
//! non-zero exit code.

pub mod docker;
pub mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use girder_core::BuildConfig;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the agent asks an executor to run.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub build_id: Uuid,
    pub scm_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub config: BuildConfig,
    pub env: HashMap<String, String>,
}

/// One captured line of build output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub stream: String,
    pub line: String,
}

impl LogEntry {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: "stdout".to_string(),
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: "stderr".to_string(),
            line: line.into(),
        }
    }
}

/// Result of running a build to completion (or interruption).
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub error_message: Option<String>,
    pub duration_seconds: i32,
    pub log_lines: Vec<LogEntry>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the build, honoring `cancel`: when the token fires the
    /// executor stops the build and returns an unsuccessful outcome.
    async fn execute(&self, req: &BuildRequest, cancel: &CancellationToken)
    -> Result<BuildOutcome>;

    /// Best-effort removal of whatever the build left behind.
    async fn cleanup(&self, build_id: Uuid);
}

/// Build an executor for the requested isolation type.
pub fn create_executor(isolation: &str) -> Result<Arc<dyn Executor>> {
    let work_dir = std::env::var("GIRDER_WORK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/girder-builds"));

    match isolation {
        "docker" => Ok(Arc::new(docker::DockerExecutor::new(work_dir)?)),
        "process" => Ok(Arc::new(process::ProcessExecutor::new(work_dir))),
        other => anyhow::bail!("unknown isolation type: {other}"),
    }
}

/// Clone the build's SCM ref into the workspace directory, appending the
/// git output to the build log. A specific commit wins over a branch; a
/// branch clone is shallow.
pub(crate) async fn clone_repository(
    req: &BuildRequest,
    build_dir: &Path,
    logs: &mut Vec<LogEntry>,
) -> Result<()> {
    logs.push(LogEntry::stdout(format!(
        "cloning repository: {}",
        req.scm_url
    )));

    if !req.commit_sha.is_empty() {
        run_git(
            &["clone", &req.scm_url, "."],
            build_dir,
            logs,
        )
        .await?;
        run_git(&["checkout", &req.commit_sha], build_dir, logs).await?;
    } else if !req.branch.is_empty() {
        run_git(
            &["clone", "-b", &req.branch, "--depth", "1", &req.scm_url, "."],
            build_dir,
            logs,
        )
        .await?;
    } else {
        run_git(
            &["clone", "--depth", "1", &req.scm_url, "."],
            build_dir,
            logs,
        )
        .await?;
    }

    logs.push(LogEntry::stdout("repository cloned"));
    Ok(())
}

async fn run_git(args: &[&str], dir: &Path, logs: &mut Vec<LogEntry>) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .context("failed to run git")?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.is_empty() {
            logs.push(LogEntry::stderr(line));
        }
    }

    if !output.status.success() {
        anyhow::bail!("git {} failed with {}", args.join(" "), output.status);
    }
    Ok(())
}

/// The commands to run, falling back to a harmless default when the job's
/// config carries none.
pub(crate) fn effective_commands(config: &BuildConfig) -> Vec<String> {
    if config.commands.is_empty() {
        vec!["echo 'no build commands specified'".to_string()]
    } else {
        config.commands.clone()
    }
}

/// Default image for container builds when the config names none.
pub(crate) fn effective_image(config: &BuildConfig) -> String {
    config
        .image
        .clone()
        .unwrap_or_else(|| "ubuntu:22.04".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_commands_get_a_default() {
        let config = BuildConfig::from_value(&json!({}));
        let commands = effective_commands(&config);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("no build commands"));
    }

    #[test]
    fn configured_commands_pass_through() {
        let config = BuildConfig::from_value(&json!({
            "commands": ["cargo build", "cargo test"]
        }));
        assert_eq!(
            effective_commands(&config),
            vec!["cargo build".to_string(), "cargo test".to_string()]
        );
    }

    #[test]
    fn image_defaults_to_ubuntu() {
        let config = BuildConfig::from_value(&json!({}));
        assert_eq!(effective_image(&config), "ubuntu:22.04");
        let config = BuildConfig::from_value(&json!({"image": "alpine:3.20"}));
        assert_eq!(effective_image(&config), "alpine:3.20");
    }

    #[test]
    fn unknown_isolation_is_rejected() {
        assert!(create_executor("vm").is_err());
    }
}
