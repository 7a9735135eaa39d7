//! Build scheduler - assigns queued builds to eligible workers.

use std::sync::Arc;
use std::time::Duration;

use girder_db::{AssignOutcome, BuildRepo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic sweep that pages queued builds in FIFO order and tries to
/// place each one on a worker. Multiple instances race safely: the claim
/// is skip-locked and the status flip is a compare-and-swap, so a lost
/// race shows up here as `AssignOutcome::Lost` and nothing else.
pub struct Scheduler {
    builds: Arc<dyn BuildRepo>,
    interval: Duration,
    batch_size: i64,
}

impl Scheduler {
    pub fn new(builds: Arc<dyn BuildRepo>, interval: Duration, batch_size: i64) -> Self {
        Self {
            builds,
            interval,
            batch_size,
        }
    }

    /// Run the scheduler loop until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = tick.tick() => self.schedule_queued().await,
            }
        }
    }

    /// One tick: page queued builds and attempt each assignment. Per-build
    /// failures are logged and skipped; the loop never aborts.
    async fn schedule_queued(&self) {
        let page = match self.builds.queued_page(self.batch_size).await {
            Ok(page) => page,
            Err(e) => {
                error!(error = %e, "failed to query queued builds");
                return;
            }
        };

        for build in page {
            match self.builds.assign(&build).await {
                Ok(AssignOutcome::Assigned(worker_id)) => {
                    info!(build_id = %build.id, worker_id = %worker_id, "build assigned to worker");
                }
                Ok(AssignOutcome::NoWorker) => {
                    debug!(build_id = %build.id, "no eligible worker, build stays queued");
                }
                Ok(AssignOutcome::Lost) => {
                    debug!(build_id = %build.id, "lost assignment race to another scheduler");
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "could not assign build");
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
        AssignedBuild, BuildFilter, BuildRecord, DbError, DbResult, OverdueBuild, QueuedBuild,
        StatusReport, TriggerBuild,
    };
    use girder_core::BuildStatus;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn queued(id: Uuid) -> QueuedBuild {
        QueuedBuild {
            id,
            job_id: Uuid::now_v7(),
            worker_id: None,
            worker_labels: serde_json::json!({}),
        }
    }

    /// BuildRepo double that serves one page and records assignment
    /// attempts, failing the ones it is told to fail.
    struct StubBuildRepo {
        page: Vec<QueuedBuild>,
        fail: Vec<Uuid>,
        attempted: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl girder_db::BuildRepo for StubBuildRepo {
        async fn queued_page(&self, limit: i64) -> DbResult<Vec<QueuedBuild>> {
            Ok(self.page.iter().take(limit as usize).cloned().collect())
        }

        async fn assign(&self, build: &QueuedBuild) -> DbResult<girder_db::AssignOutcome> {
            self.attempted.lock().unwrap().push(build.id);
            if self.fail.contains(&build.id) {
                return Err(DbError::Conflict("stub failure".to_string()));
            }
            Ok(girder_db::AssignOutcome::Assigned(Uuid::now_v7()))
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
        async fn update_status_checked(
            &self,
            _id: Uuid,
            _from: BuildStatus,
            _to: BuildStatus,
            _report: StatusReport,
        ) -> DbResult<BuildRecord> {
            unimplemented!()
        }
        async fn cancel(&self, _id: Uuid) -> DbResult<BuildRecord> {
            unimplemented!()
        }
        async fn list_overdue_running(&self) -> DbResult<Vec<OverdueBuild>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn tick_attempts_every_build_and_survives_failures() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::now_v7()).collect();
        let repo = Arc::new(StubBuildRepo {
            page: ids.iter().copied().map(queued).collect(),
            fail: vec![ids[1]],
            attempted: Mutex::new(Vec::new()),
        });

        let scheduler = Scheduler::new(repo.clone(), Duration::from_secs(5), 10);
        scheduler.schedule_queued().await;

        // The failing build did not stop the sweep.
        assert_eq!(*repo.attempted.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn tick_respects_the_batch_size() {
        let ids: Vec<Uuid> = (0..8).map(|_| Uuid::now_v7()).collect();
        let repo = Arc::new(StubBuildRepo {
            page: ids.iter().copied().map(queued).collect(),
            fail: Vec::new(),
            attempted: Mutex::new(Vec::new()),
        });

        let scheduler = Scheduler::new(repo.clone(), Duration::from_secs(5), 3);
        scheduler.schedule_queued().await;

        assert_eq!(repo.attempted.lock().unwrap().len(), 3);
    }
}
