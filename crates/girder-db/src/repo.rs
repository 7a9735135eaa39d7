//! Repository traits and implementations.

pub mod build;
pub mod job;
pub mod logs;
pub mod worker;

pub use build::{
    AssignOutcome, AssignedBuild, BuildFilter, BuildRecord, BuildRepo, OverdueBuild, PgBuildRepo,
    QueuedBuild, StatusReport, TriggerBuild,
};
pub use job::{JobRecord, JobRepo, NewJob, PgJobRepo};
pub use logs::{BuildLogRecord, BuildLogRepo, NewLogLine, PgBuildLogRepo};
pub use worker::{
    HeartbeatReply, HeartbeatUpdate, PgWorkerRepo, ReapedWorker, RegisterWorker, WorkerRecord,
    WorkerRepo, WorkerUpdate,
};
