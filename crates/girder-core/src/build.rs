//! Build status and the transition rules enforced by the control plane.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status of a single build execution.
///
/// A build starts in `Queued` and moves through the state machine below;
/// terminal statuses have no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
    Timeout,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::Timeout => "timeout",
        }
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success
                | BuildStatus::Failure
                | BuildStatus::Cancelled
                | BuildStatus::Timeout
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Edges:
    /// - queued  -> running | cancelled
    /// - running -> success | failure | cancelled | timeout
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match (self, next) {
            (BuildStatus::Queued, BuildStatus::Running) => true,
            (BuildStatus::Queued, BuildStatus::Cancelled) => true,
            (BuildStatus::Running, BuildStatus::Success) => true,
            (BuildStatus::Running, BuildStatus::Failure) => true,
            (BuildStatus::Running, BuildStatus::Cancelled) => true,
            (BuildStatus::Running, BuildStatus::Timeout) => true,
            _ => false,
        }
    }

    /// The prior status a worker's status report must compare-and-swap
    /// against when moving a build to `target`.
    ///
    /// Returns `InvalidInput` for targets a report can never produce
    /// (`queued` is the initial state, nothing transitions into it).
    pub fn required_prior(target: BuildStatus) -> Result<BuildStatus> {
        match target {
            BuildStatus::Running => Ok(BuildStatus::Queued),
            BuildStatus::Success
            | BuildStatus::Failure
            | BuildStatus::Cancelled
            | BuildStatus::Timeout => Ok(BuildStatus::Running),
            BuildStatus::Queued => Err(Error::InvalidInput(
                "a build cannot be reported back to queued".to_string(),
            )),
        }
    }

    pub const ALL: [BuildStatus; 6] = [
        BuildStatus::Queued,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failure,
        BuildStatus::Cancelled,
        BuildStatus::Timeout,
    ];
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(BuildStatus::Queued),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failure" => Ok(BuildStatus::Failure),
            "cancelled" => Ok(BuildStatus::Cancelled),
            "timeout" => Ok(BuildStatus::Timeout),
            other => Err(Error::InvalidInput(format!(
                "unknown build status: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in BuildStatus::ALL {
            if from.is_terminal() {
                for to in BuildStatus::ALL {
                    assert!(
                        !from.can_transition_to(to),
                        "{from} -> {to} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn queued_edges() {
        assert!(BuildStatus::Queued.can_transition_to(BuildStatus::Running));
        assert!(BuildStatus::Queued.can_transition_to(BuildStatus::Cancelled));
        assert!(!BuildStatus::Queued.can_transition_to(BuildStatus::Success));
        assert!(!BuildStatus::Queued.can_transition_to(BuildStatus::Failure));
        assert!(!BuildStatus::Queued.can_transition_to(BuildStatus::Timeout));
        assert!(!BuildStatus::Queued.can_transition_to(BuildStatus::Queued));
    }

    #[test]
    fn running_edges() {
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Success));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Failure));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Cancelled));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Timeout));
        assert!(!BuildStatus::Running.can_transition_to(BuildStatus::Queued));
        assert!(!BuildStatus::Running.can_transition_to(BuildStatus::Running));
    }

    #[test]
    fn reporting_queued_is_invalid() {
        assert!(BuildStatus::required_prior(BuildStatus::Queued).is_err());
    }

    #[test]
    fn wire_spelling_round_trips() {
        for status in BuildStatus::ALL {
            let parsed: BuildStatus = status.as_str().parse().unwrap();
            assert_eq!(status, parsed);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    fn any_status() -> impl Strategy<Value = BuildStatus> {
        prop::sample::select(BuildStatus::ALL.to_vec())
    }

    proptest! {
        /// `required_prior` and `can_transition_to` must agree: a report
        /// accepted by the CAS precondition is exactly a legal edge.
        #[test]
        fn required_prior_matches_edges(target in any_status(), from in any_status()) {
            match BuildStatus::required_prior(target) {
                Ok(prior) => {
                    prop_assert_eq!(from == prior, from.can_transition_to(target));
                }
                Err(_) => {
                    // Nothing transitions into queued.
                    prop_assert!(!from.can_transition_to(target));
                }
            }
        }

        /// Any walk that only takes allowed edges ends after at most two
        /// steps from queued, and never leaves a terminal status.
        #[test]
        fn walks_terminate(steps in prop::collection::vec(any_status(), 0..8)) {
            let mut current = BuildStatus::Queued;
            let mut hops = 0usize;
            for next in steps {
                if current.can_transition_to(next) {
                    prop_assert!(!current.is_terminal());
                    current = next;
                    hops += 1;
                }
            }
            prop_assert!(hops <= 2);
        }
    }
}
