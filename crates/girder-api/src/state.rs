//! Application state.

use std::sync::Arc;

use girder_db::{PgBuildLogRepo, PgBuildRepo, PgJobRepo, PgWorkerRepo};
use sqlx::PgPool;

use crate::Config;
use crate::ws::EventBroadcaster;

/// Shared application state. Per-instance state is read-only config, the
/// connection pool, and the event fan-out; all mutable coordination goes
/// through the store.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jobs: Arc<PgJobRepo>,
    pub builds: Arc<PgBuildRepo>,
    pub workers: Arc<PgWorkerRepo>,
    pub logs: Arc<PgBuildLogRepo>,
    pub events: EventBroadcaster,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            builds: Arc::new(PgBuildRepo::new(pool.clone())),
            workers: Arc::new(PgWorkerRepo::new(pool.clone())),
            logs: Arc::new(PgBuildLogRepo::new(pool.clone())),
            events: EventBroadcaster::new(),
            config: Arc::new(config),
            pool,
        }
    }
}
