//! The agent coordinator: registration, heartbeats, build polling, and
//! per-build execution tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use girder_core::BuildConfig;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{
    ApiClient, AssignedBuild, HeartbeatRequest, LogLine, RegisterRequest, ReportOutcome,
    StatusUpdate,
};
use crate::executor::{BuildOutcome, BuildRequest, Executor};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const LOG_BATCH: usize = 500;
const REPORT_ATTEMPTS: u32 = 5;

/// Agent configuration assembled from flags and detected system info.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_server: String,
    pub worker_name: String,
    pub max_concurrent: usize,
    pub isolation: String,
    pub labels: HashMap<String, String>,
    pub hostname: String,
    pub ip_address: String,
    pub cpu_cores: i32,
    pub memory_mb: i32,
}

/// The worker agent: one registration, a heartbeat loop, and a poll loop
/// that spawns one task per in-flight build, bounded by `max_concurrent`.
pub struct Agent {
    config: AgentConfig,
    client: Arc<ApiClient>,
    executor: Arc<dyn Executor>,
    worker_id: Uuid,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, client: ApiClient, executor: Arc<dyn Executor>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            client: Arc::new(client),
            executor,
            worker_id: Uuid::nil(),
            slots,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register and run until the token is cancelled. Registration
    /// failure is fatal; everything after it is retried on the next tick.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.register().await?;
        let agent = Arc::new(self);

        let heartbeat_agent = agent.clone();
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = heartbeat_shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        match heartbeat_agent.send_heartbeat().await {
                            Ok(true) => {
                                debug!("work available, fetching immediately");
                                heartbeat_agent.check_for_builds().await;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "failed to send heartbeat"),
                        }
                    }
                }
            }
        });

        let mut tick = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if agent.slots.available_permits() > 0 {
                        agent.check_for_builds().await;
                    }
                }
            }
        }

        heartbeat.abort();
        agent.wait_for_in_flight().await;
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let req = RegisterRequest {
            name: self.config.worker_name.clone(),
            hostname: self.config.hostname.clone(),
            ip_address: self.config.ip_address.clone(),
            max_concurrent_builds: self.config.max_concurrent as i32,
            cpu_cores: self.config.cpu_cores,
            memory_mb: self.config.memory_mb,
            labels: self.config.labels.clone(),
            capabilities: HashMap::from([
                ("docker".to_string(), self.config.isolation == "docker"),
                ("process".to_string(), self.config.isolation == "process"),
            ]),
            agent_version: AGENT_VERSION.to_string(),
        };

        let worker = self
            .client
            .register(&req)
            .await
            .context("registration with the API server failed")?;
        self.worker_id = worker.id;

        info!(
            worker_id = %worker.id,
            worker_name = %worker.name,
            "worker registered"
        );
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<bool> {
        let current_builds =
            (self.config.max_concurrent - self.slots.available_permits()) as i32;
        let reply = self
            .client
            .heartbeat(
                self.worker_id,
                &HeartbeatRequest {
                    current_builds,
                    health_status: "healthy".to_string(),
                },
            )
            .await?;
        debug!(status = %reply.status, has_work = reply.has_work, "heartbeat sent");
        Ok(reply.has_work)
    }

    /// Fetch assigned builds and start one task per build while capacity
    /// lasts. Builds already executing here are skipped.
    async fn check_for_builds(self: &Arc<Self>) {
        let builds = match self.client.fetch_builds(self.worker_id).await {
            Ok(builds) => builds,
            Err(e) => {
                warn!(error = %e, "failed to fetch assigned builds");
                return;
            }
        };

        if builds.is_empty() {
            return;
        }
        debug!(count = builds.len(), "assigned builds pending");

        for build in builds {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("max concurrent builds reached");
                    break;
                }
            };

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(build.id) {
                    continue;
                }
            }

            let agent = self.clone();
            tokio::spawn(async move {
                let build_id = build.id;
                agent.execute_build(build).await;
                agent.in_flight.lock().await.remove(&build_id);
                drop(permit);
            });
        }
    }

    async fn execute_build(&self, build: AssignedBuild) {
        info!(
            build_id = %build.id,
            job_name = %build.job_name,
            build_number = build.build_number,
            "starting build"
        );

        // A queued build is ours to start; a running one was already
        // flipped by the scheduler when it claimed us.
        if build.status == "queued" {
            let update = StatusUpdate {
                status: "running".to_string(),
                started_at: Some(Utc::now()),
                ..StatusUpdate::default()
            };
            match self.client.report_status(build.id, &update).await {
                Ok(ReportOutcome::Applied) => {}
                Ok(ReportOutcome::Conflict) => {
                    match self.client.build_status(build.id).await {
                        Ok(status) if status == "running" => {}
                        Ok(status) => {
                            info!(build_id = %build.id, %status, "build moved on, skipping");
                            return;
                        }
                        Err(e) => {
                            warn!(build_id = %build.id, error = %e, "could not confirm build state");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(build_id = %build.id, error = %e, "failed to report build running");
                    return;
                }
            }
        }

        let request = BuildRequest {
            build_id: build.id,
            scm_url: build.scm_url.clone(),
            branch: build.branch.clone(),
            commit_sha: build.scm_commit_sha.clone(),
            config: BuildConfig::from_value(&build.build_config),
            env: HashMap::new(),
        };

        // Cancellation is pull-based: the control plane flips the build
        // row and we notice on the next poll.
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_for_stop(
            self.client.clone(),
            build.id,
            cancel.clone(),
        ));

        let outcome = match self.executor.execute(&request, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(build_id = %build.id, error = %e, "executor failed");
                BuildOutcome {
                    success: false,
                    exit_code: -1,
                    error_message: Some(e.to_string()),
                    duration_seconds: 0,
                    log_lines: Vec::new(),
                }
            }
        };
        watcher.abort();

        self.ship_logs(build.id, &outcome).await;

        if cancel.is_cancelled() {
            info!(build_id = %build.id, "build stopped by the control plane");
        } else {
            let status = if outcome.success { "success" } else { "failure" };
            let update = StatusUpdate {
                status: status.to_string(),
                completed_at: Some(Utc::now()),
                exit_code: Some(outcome.exit_code),
                error_message: outcome.error_message.clone(),
                duration_seconds: Some(outcome.duration_seconds),
                ..StatusUpdate::default()
            };
            self.report_terminal(build.id, update).await;

            if outcome.success {
                info!(
                    build_id = %build.id,
                    duration = outcome.duration_seconds,
                    "build completed"
                );
            } else {
                warn!(
                    build_id = %build.id,
                    exit_code = outcome.exit_code,
                    "build failed"
                );
            }
        }

        self.executor.cleanup(build.id).await;
    }

    async fn ship_logs(&self, build_id: Uuid, outcome: &BuildOutcome) {
        let lines: Vec<LogLine> = outcome
            .log_lines
            .iter()
            .map(|entry| LogLine {
                stream: entry.stream.clone(),
                line: entry.line.clone(),
            })
            .collect();

        for chunk in lines.chunks(LOG_BATCH) {
            if let Err(e) = self.client.append_logs(build_id, chunk).await {
                warn!(build_id = %build_id, error = %e, "failed to ship build logs");
                break;
            }
        }
    }

    /// Terminal transitions are retried; dropping one silently would leave
    /// the build running forever from the control plane's point of view.
    async fn report_terminal(&self, build_id: Uuid, update: StatusUpdate) {
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.report_status(build_id, &update).await {
                Ok(ReportOutcome::Applied) => return,
                Ok(ReportOutcome::Conflict) => {
                    warn!(build_id = %build_id, "terminal report rejected, build already moved");
                    return;
                }
                Err(e) => {
                    warn!(
                        build_id = %build_id,
                        attempt,
                        error = %e,
                        "failed to report terminal status"
                    );
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
            }
        }
        error!(
            build_id = %build_id,
            status = %update.status,
            "giving up on terminal status report"
        );
    }

    async fn wait_for_in_flight(&self) {
        if self.slots.available_permits() == self.config.max_concurrent {
            return;
        }
        info!("waiting for in-flight builds to finish");
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.slots.available_permits() < self.config.max_concurrent
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Polls the build row while it executes; any status other than running
/// is a stop signal for the executor.
async fn watch_for_stop(client: Arc<ApiClient>, build_id: Uuid, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(CANCEL_POLL_INTERVAL);
    tick.tick().await;
    loop {
        tick.tick().await;
        match client.build_status(build_id).await {
            Ok(status) if status == "running" => {}
            Ok(status) => {
                info!(build_id = %build_id, %status, "build no longer running, stopping");
                cancel.cancel();
                return;
            }
            Err(e) => debug!(build_id = %build_id, error = %e, "could not poll build status"),
        }
    }
}
