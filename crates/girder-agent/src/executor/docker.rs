//! Docker executor: runs each build's commands in a container with the
//! workspace bind-mounted.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    BuildOutcome, BuildRequest, Executor, LogEntry, clone_repository, effective_commands,
    effective_image,
};

pub struct DockerExecutor {
    docker: Docker,
    work_dir: PathBuf,
}

impl DockerExecutor {
    pub fn new(work_dir: PathBuf) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the Docker daemon")?;
        Ok(Self { docker, work_dir })
    }

    fn container_name(build_id: Uuid) -> String {
        format!("girder-build-{build_id}")
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
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

        let image = effective_image(&req.config);
        logs.push(LogEntry::stdout(format!("using image: {image}")));

        info!(build_id = %req.build_id, image = %image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "pull warning"),
            }
        }

        let mut env_map = req.env.clone();
        env_map.extend(req.config.env.clone());
        let env: Vec<String> = env_map.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let script = effective_commands(&req.config).join(" && ");
        let container_name = Self::container_name(req.build_id);

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:/workspace", build_dir.display())]),
            ..Default::default()
        };
        let config = Config {
            image: Some(image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            env: Some(env),
            working_dir: Some("/workspace".to_string()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        info!(container = %container_name, "creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("failed to create container")?;

        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container")?;

        // Collect output on the side while we wait for the container.
        let docker = self.docker.clone();
        let log_container = container_name.clone();
        let collector = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut stream = docker.logs(
                &log_container,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            lines.push(LogEntry::stdout(line));
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            lines.push(LogEntry::stderr(line));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "log stream error");
                        break;
                    }
                }
            }
            lines
        });

        let mut wait =
            self.docker
                .wait_container(&container_name, None::<WaitContainerOptions<String>>);

        let mut cancelled = false;
        let exit_code: i64 = tokio::select! {
            result = wait.next() => match result {
                Some(Ok(response)) => response.status_code,
                Some(Err(e)) => {
                    warn!(error = %e, "container wait failed");
                    -1
                }
                None => -1,
            },
            _ = cancel.cancelled() => {
                info!(container = %container_name, "stopping cancelled build");
                let _ = self
                    .docker
                    .kill_container(&container_name, None::<KillContainerOptions<String>>)
                    .await;
                cancelled = true;
                -1
            }
        };

        if let Ok(collected) = collector.await {
            logs.extend(collected);
        }

        let _ = self
            .docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

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
                exit_code: exit_code as i32,
                error_message: (!success)
                    .then(|| format!("build failed with exit code {exit_code}")),
                duration_seconds: start.elapsed().as_secs() as i32,
                log_lines: logs,
            }
        };
        Ok(outcome)
    }

    async fn cleanup(&self, build_id: Uuid) {
        debug!(build_id = %build_id, "cleaning up docker build");

        let build_dir = self.work_dir.join(build_id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&build_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(build_id = %build_id, error = %e, "failed to remove build directory");
            }
        }

        let _ = self
            .docker
            .remove_container(
                &Self::container_name(build_id),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}
