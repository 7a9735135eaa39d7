//! Process executor: runs the build's commands directly on the host.
//! No container isolation; intended for trusted environments and tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BuildOutcome, BuildRequest, Executor, LogEntry, clone_repository, effective_commands};

pub struct ProcessExecutor {
    work_dir: PathBuf,
}

impl ProcessExecutor {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        req: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let start = Instant::now();
        let mut logs = Vec::new();

        let build_dir = self.work_dir.join(req.build_id.to_string());
        tokio::fs::create_dir_all(&build_dir)
            .await
            .context("failed to create build directory")?;

        if !req.scm_url.is_empty() {
            if let Err(e) = clone_repository(req, &build_dir, &mut logs).await {
                return Ok(BuildOutcome {
                    success: false,
                    exit_code: 1,
                    error_message: Some(format!("failed to clone repository: {e}")),
                    duration_seconds: start.elapsed().as_secs() as i32,
                    log_lines: logs,
                });
            }
        }

        let script = effective_commands(&req.config).join(" && ");
        logs.push(LogEntry::stdout(format!("running: {script}")));

        let mut env_map = req.env.clone();
        env_map.extend(req.config.env.clone());

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .current_dir(&build_dir)
            .envs(&env_map)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn build shell")?;

        let stdout = child
            .stdout
            .take()
            .context("build shell has no stdout pipe")?;
        let stderr = child
            .stderr
            .take()
            .context("build shell has no stderr pipe")?;

        let stdout_reader = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                lines.push(LogEntry::stdout(line));
            }
            lines
        });
        let stderr_reader = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                lines.push(LogEntry::stderr(line));
            }
            lines
        });

        let mut cancelled = false;
        let exit_code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(build_id = %req.build_id, error = %e, "failed to wait for build shell");
                    -1
                }
            },
            _ = cancel.cancelled() => {
                info!(build_id = %req.build_id, "killing cancelled build");
                let _ = child.kill().await;
                cancelled = true;
                -1
            }
        };

        if let Ok(lines) = stdout_reader.await {
            logs.extend(lines);
        }
        if let Ok(lines) = stderr_reader.await {
            logs.extend(lines);
        }

        let outcome = if cancelled {
            BuildOutcome {
                success: false,
                exit_code: -1,
                error_message: Some("build cancelled".to_string()),
                duration_seconds: start.elapsed().as_secs() as i32,
                log_lines: logs,
            }
        } else {
            let success = exit_code == 0;
            BuildOutcome {
                success,
                exit_code,
                error_message: (!success)
                    .then(|| format!("build failed with exit code {exit_code}")),
                duration_seconds: start.elapsed().as_secs() as i32,
                log_lines: logs,
            }
        };
        Ok(outcome)
    }

    async fn cleanup(&self, build_id: Uuid) {
        debug!(build_id = %build_id, "cleaning up build directory");
        let build_dir = self.work_dir.join(build_id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(build_id = %build_id, error = %e, "failed to remove build directory");
            }
        }
    }
}
