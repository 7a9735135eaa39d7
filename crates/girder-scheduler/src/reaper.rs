//! Worker reaper and build timeout sweep.

use std::sync::Arc;
use std::time::Duration;

use girder_core::{BuildStatus, Error, Result};
use girder_db::{BuildRepo, DbError, StatusReport, WorkerRepo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with builds left running on a worker the reaper marked
/// offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LostWorkerPolicy {
    /// Leave them; the timeout sweep transitions them once the owning
    /// job's timeout elapses.
    #[default]
    Timeout,
    /// Put them back in the queue for reassignment. Only safe when builds
    /// are idempotent.
    Requeue,
}

impl std::str::FromStr for LostWorkerPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "timeout" => Ok(LostWorkerPolicy::Timeout),
            "requeue" => Ok(LostWorkerPolicy::Requeue),
            other => Err(Error::InvalidInput(format!(
                "unknown lost worker policy: {other}"
            ))),
        }
    }
}

/// Periodic sweep that marks missed-heartbeat workers offline and times
/// out builds that outran their job's deadline.
pub struct Reaper {
    workers: Arc<dyn WorkerRepo>,
    builds: Arc<dyn BuildRepo>,
    interval: Duration,
    heartbeat_timeout: Duration,
    policy: LostWorkerPolicy,
}

impl Reaper {
    pub fn new(
        workers: Arc<dyn WorkerRepo>,
        builds: Arc<dyn BuildRepo>,
        interval: Duration,
        heartbeat_timeout: Duration,
        policy: LostWorkerPolicy,
    ) -> Self {
        Self {
            workers,
            builds,
            interval,
            heartbeat_timeout,
            policy,
        }
    }

    /// Run the reaper loop until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        info!("worker reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker reaper stopped");
                    return;
                }
                _ = tick.tick() => {
                    self.reap_stale_workers().await;
                    self.sweep_overdue_builds().await;
                }
            }
        }
    }

    async fn reap_stale_workers(&self) {
        let requeue = self.policy == LostWorkerPolicy::Requeue;
        match self
            .workers
            .reap_stale(self.heartbeat_timeout.as_secs() as i64, requeue)
            .await
        {
            Ok(reaped) => {
                for worker in &reaped {
                    warn!(
                        worker_id = %worker.id,
                        worker_name = %worker.name,
                        "worker marked offline after missed heartbeats"
                    );
                }
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "marked workers offline");
                }
            }
            Err(e) => error!(error = %e, "failed to reap stale workers"),
        }
    }

    /// Transition overdue running builds to timeout. Each build goes
    /// through the same conditional update as a worker report, so a
    /// concurrent terminal report wins cleanly and shows up as a conflict
    /// here.
    async fn sweep_overdue_builds(&self) {
        let overdue = match self.builds.list_overdue_running().await {
            Ok(overdue) => overdue,
            Err(e) => {
                error!(error = %e, "failed to query overdue builds");
                return;
            }
        };

        for build in overdue {
            let report = StatusReport {
                error_message: Some(format!(
                    "build exceeded job timeout of {} minutes",
                    build.timeout_minutes
                )),
                ..StatusReport::default()
            };
            match self
                .builds
                .update_status_checked(build.id, BuildStatus::Running, BuildStatus::Timeout, report)
                .await
            {
                Ok(_) => {
                    warn!(
                        build_id = %build.id,
                        job_id = %build.job_id,
                        timeout_minutes = build.timeout_minutes,
                        "build timed out"
                    );
                }
                Err(DbError::Conflict(_)) => {
                    debug!(build_id = %build.id, "build finished before timeout sweep");
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "failed to time out build");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use girder_db::{
        AssignOutcome, AssignedBuild, BuildFilter, BuildRecord, DbResult, HeartbeatReply,
        HeartbeatUpdate, OverdueBuild, QueuedBuild, ReapedWorker, RegisterWorker, TriggerBuild,
        WorkerRecord, WorkerUpdate,
    };
    use std::sync::Mutex;
    use uuid::Uuid;

    #[test]
    fn lost_worker_policy_parses_known_values() {
        assert_eq!(
            "timeout".parse::<LostWorkerPolicy>().unwrap(),
            LostWorkerPolicy::Timeout
        );
        assert_eq!(
            "requeue".parse::<LostWorkerPolicy>().unwrap(),
            LostWorkerPolicy::Requeue
        );
        assert!("reassign".parse::<LostWorkerPolicy>().is_err());
    }

    struct StubWorkerRepo {
        reaped: Vec<ReapedWorker>,
        requeue_seen: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl girder_db::WorkerRepo for StubWorkerRepo {
        async fn reap_stale(
            &self,
            _threshold_seconds: i64,
            requeue: bool,
        ) -> DbResult<Vec<ReapedWorker>> {
            *self.requeue_seen.lock().unwrap() = Some(requeue);
            Ok(self.reaped.clone())
        }

        async fn register(
            &self,
            _req: RegisterWorker,
            _default_max: i32,
        ) -> DbResult<WorkerRecord> {
            unimplemented!()
        }
        async fn heartbeat(&self, _id: Uuid, _beat: HeartbeatUpdate) -> DbResult<HeartbeatReply> {
            unimplemented!()
        }
        async fn drain(&self, _id: Uuid) -> DbResult<()> {
            unimplemented!()
        }
        async fn get(&self, _id: Uuid) -> DbResult<WorkerRecord> {
            unimplemented!()
        }
        async fn list(&self) -> DbResult<Vec<WorkerRecord>> {
            unimplemented!()
        }
        async fn update(&self, _id: Uuid, _update: WorkerUpdate) -> DbResult<()> {
            unimplemented!()
        }
    }

    struct StubBuildRepo {
        overdue: Vec<OverdueBuild>,
        conflicts: Vec<Uuid>,
        timed_out: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl girder_db::BuildRepo for StubBuildRepo {
        async fn list_overdue_running(&self) -> DbResult<Vec<OverdueBuild>> {
            Ok(self.overdue.clone())
        }

        async fn update_status_checked(
            &self,
            id: Uuid,
            from: BuildStatus,
            to: BuildStatus,
            _report: StatusReport,
        ) -> DbResult<BuildRecord> {
            assert_eq!(from, BuildStatus::Running);
            assert_eq!(to, BuildStatus::Timeout);
            if self.conflicts.contains(&id) {
                return Err(DbError::Conflict("already finished".to_string()));
            }
            self.timed_out.lock().unwrap().push(id);
            Ok(BuildRecord {
                id,
                job_id: Uuid::now_v7(),
                build_number: 1,
                status: "timeout".to_string(),
                worker_id: None,
                queued_at: chrono::Utc::now(),
                started_at: None,
                completed_at: Some(chrono::Utc::now()),
                duration_seconds: None,
                exit_code: None,
                error_message: String::new(),
                scm_commit_sha: String::new(),
                scm_commit_message: String::new(),
                scm_author: String::new(),
                branch: String::new(),
                build_config: serde_json::json!({}),
                triggered_by: String::new(),
                created_at: chrono::Utc::now(),
            })
        }

        async fn create(
            &self,
            _job: &girder_db::JobRecord,
            _trigger: TriggerBuild,
        ) -> DbResult<BuildRecord> {
            unimplemented!()
        }
        async fn get(&self, _id: Uuid) -> DbResult<BuildRecord> {
            unimplemented!()
        }
        async fn list(&self, _filter: BuildFilter) -> DbResult<Vec<BuildRecord>> {
            unimplemented!()
        }
        async fn fetch_assigned(
            &self,
            _worker_id: Uuid,
            _limit: i64,
        ) -> DbResult<Vec<AssignedBuild>> {
            unimplemented!()
        }
        async fn queued_page(&self, _limit: i64) -> DbResult<Vec<QueuedBuild>> {
            unimplemented!()
        }
        async fn assign(&self, _build: &QueuedBuild) -> DbResult<AssignOutcome> {
            unimplemented!()
        }
        async fn cancel(&self, _id: Uuid) -> DbResult<BuildRecord> {
            unimplemented!()
        }
    }

    fn overdue(id: Uuid) -> OverdueBuild {
        OverdueBuild {
            id,
            job_id: Uuid::now_v7(),
            worker_id: Some(Uuid::now_v7()),
            timeout_minutes: 60,
        }
    }

    fn reaper(workers: Arc<StubWorkerRepo>, builds: Arc<StubBuildRepo>) -> Reaper {
        Reaper::new(
            workers,
            builds,
            Duration::from_secs(30),
            Duration::from_secs(120),
            LostWorkerPolicy::Requeue,
        )
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_builds_and_tolerates_conflicts() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();
        let workers = Arc::new(StubWorkerRepo {
            reaped: Vec::new(),
            requeue_seen: Mutex::new(None),
        });
        let builds = Arc::new(StubBuildRepo {
            overdue: ids.iter().copied().map(overdue).collect(),
            conflicts: vec![ids[0]],
            timed_out: Mutex::new(Vec::new()),
        });

        reaper(workers, builds.clone()).sweep_overdue_builds().await;

        // The conflicted build was skipped, the rest were timed out.
        assert_eq!(*builds.timed_out.lock().unwrap(), ids[1..]);
    }

    #[tokio::test]
    async fn reap_passes_the_configured_policy_through() {
        let workers = Arc::new(StubWorkerRepo {
            reaped: vec![ReapedWorker {
                id: Uuid::now_v7(),
                name: "w1".to_string(),
            }],
            requeue_seen: Mutex::new(None),
        });
        let builds = Arc::new(StubBuildRepo {
            overdue: Vec::new(),
            conflicts: Vec::new(),
            timed_out: Mutex::new(Vec::new()),
        });

        reaper(workers.clone(), builds).reap_stale_workers().await;

        assert_eq!(*workers.requeue_seen.lock().unwrap(), Some(true));
    }
}
