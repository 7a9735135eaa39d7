//! Worker status and scheduling eligibility.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lifecycle status of a worker node.
///
/// `online <-> offline` via heartbeat and reaper, `online -> draining` by
/// explicit request, `draining -> offline` once the drained worker stops
/// heartbeating. `maintenance` is admin-set and sticks until an admin
/// clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
    Draining,
    Maintenance,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Maintenance => "maintenance",
        }
    }

    /// Whether the scheduler may assign new builds to a worker in this
    /// status. Draining and maintenance workers keep their in-flight
    /// builds but refuse new ones.
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Online)
    }

    /// Statuses a heartbeat must not overwrite back to online.
    pub fn is_held(&self) -> bool {
        matches!(self, WorkerStatus::Draining | WorkerStatus::Maintenance)
    }

    /// Statuses whose workers are expected to keep heartbeating; the
    /// reaper marks these offline once the heartbeat goes stale. A
    /// maintenance hold is admin-owned and outlasts silence.
    pub fn expects_heartbeat(&self) -> bool {
        matches!(self, WorkerStatus::Online | WorkerStatus::Draining)
    }

    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Online,
        WorkerStatus::Offline,
        WorkerStatus::Draining,
        WorkerStatus::Maintenance,
    ];
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "online" => Ok(WorkerStatus::Online),
            "offline" => Ok(WorkerStatus::Offline),
            "draining" => Ok(WorkerStatus::Draining),
            "maintenance" => Ok(WorkerStatus::Maintenance),
            other => Err(Error::InvalidInput(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_online_accepts_work() {
        assert!(WorkerStatus::Online.accepts_work());
        assert!(!WorkerStatus::Offline.accepts_work());
        assert!(!WorkerStatus::Draining.accepts_work());
        assert!(!WorkerStatus::Maintenance.accepts_work());
    }

    #[test]
    fn held_statuses_survive_heartbeat() {
        assert!(WorkerStatus::Draining.is_held());
        assert!(WorkerStatus::Maintenance.is_held());
        assert!(!WorkerStatus::Online.is_held());
        assert!(!WorkerStatus::Offline.is_held());
    }

    #[test]
    fn only_online_and_draining_expect_heartbeats() {
        assert!(WorkerStatus::Online.expects_heartbeat());
        assert!(WorkerStatus::Draining.expects_heartbeat());
        assert!(!WorkerStatus::Offline.expects_heartbeat());
        assert!(!WorkerStatus::Maintenance.expects_heartbeat());
    }

    #[test]
    fn held_and_accepting_never_overlap() {
        for status in WorkerStatus::ALL {
            assert!(!(status.accepts_work() && status.is_held()));
        }
    }
}
