//! Result of one build attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{JobStatus, StatusUpdate};
use crate::{BuildId, Result};

/// How a build attempt ended, as decided by the execution monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    Success { size: i64, duration_ms: i64 },
    RetryableFailure { reason: String },
    PermanentFailure { reason: String },
}

impl BuildOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            BuildOutcome::Success { .. } => JobStatus::Success,
            BuildOutcome::RetryableFailure { .. } => JobStatus::RetryableFailed,
            BuildOutcome::PermanentFailure { .. } => JobStatus::PermanentFailed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            BuildOutcome::Success { .. } => None,
            BuildOutcome::RetryableFailure { reason } | BuildOutcome::PermanentFailure { reason } => {
                Some(reason)
            }
        }
    }

    /// The store mutation recording this outcome.
    pub fn to_update(&self) -> StatusUpdate {
        match self {
            BuildOutcome::Success { size, duration_ms } => StatusUpdate::Succeeded {
                size: *size,
                duration_ms: *duration_ms,
            },
            BuildOutcome::RetryableFailure { reason } => StatusUpdate::RetryableFailure {
                message: reason.clone(),
            },
            BuildOutcome::PermanentFailure { reason } => StatusUpdate::PermanentFailure {
                message: reason.clone(),
            },
        }
    }
}

/// Receives the terminal outcome of a build attempt.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, id: &BuildId, outcome: BuildOutcome) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_maps_to_update() {
        let outcome = BuildOutcome::RetryableFailure {
            reason: "Build failed with exit code 1".into(),
        };
        assert_eq!(outcome.status(), JobStatus::RetryableFailed);
        assert_eq!(outcome.reason(), Some("Build failed with exit code 1"));
        assert_eq!(outcome.to_update().target(), JobStatus::RetryableFailed);

        let success = BuildOutcome::Success {
            size: 2048,
            duration_ms: 31_000,
        };
        assert_eq!(success.reason(), None);
        assert_eq!(
            success.to_update(),
            StatusUpdate::Succeeded {
                size: 2048,
                duration_ms: 31_000
            }
        );
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(BuildOutcome::PermanentFailure {
            reason: "no".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "outcome": "permanent_failure", "reason": "no" })
        );
    }
}
