//! Build job record and lifecycle state machine.
//!
//! ```text
//! queued ──► running ──► success
//!   ▲           ├──────► permanent_failed
//!   │           └──────► retryable_failed ──┐
//!   └───────────────────────────────────────┘ (while attempts remain)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{BuildId, Error, Result};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    RetryableFailed,
    PermanentFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::RetryableFailed,
        JobStatus::PermanentFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::RetryableFailed => "retryable_failed",
            JobStatus::PermanentFailed => "permanent_failed",
        }
    }

    /// Whether `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Success)
                | (Running, RetryableFailed)
                | (Running, PermanentFailed)
                | (RetryableFailed, Queued)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }

    /// `success` and `permanent_failed` never move again. `retryable_failed`
    /// is terminal only once the dispatch queue declines to retry it.
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::PermanentFailed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {}", s)))
    }
}

/// A build job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: BuildId,
    pub repo_url: String,
    pub user_id: Option<String>,
    pub env_vars: BTreeMap<String, String>,
    pub status: JobStatus,
    pub retry_count: u32,
    /// Total bytes of uploaded build output.
    pub build_size: Option<i64>,
    /// Wall-clock build time in milliseconds.
    pub build_duration: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job in `queued`.
    pub fn new(
        id: BuildId,
        repo_url: impl Into<String>,
        user_id: Option<String>,
        env_vars: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            repo_url: repo_url.into(),
            user_id,
            env_vars,
            status: JobStatus::Queued,
            retry_count: 0,
            build_size: None,
            build_duration: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update in place, refusing edges outside the lifecycle graph.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<()> {
        let target = update.target();
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: target,
            });
        }

        match update {
            StatusUpdate::Started | StatusUpdate::Requeued => {}
            StatusUpdate::Succeeded { size, duration_ms } => {
                self.build_size = Some(*size);
                self.build_duration = Some(*duration_ms);
                self.error_message = None;
            }
            StatusUpdate::RetryableFailure { message } => {
                self.retry_count += 1;
                self.error_message = Some(message.clone());
            }
            StatusUpdate::PermanentFailure { message } => {
                self.error_message = Some(message.clone());
            }
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }
}

/// The closed set of status mutations. Each variant names the only fields it
/// may write alongside `status` and `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusUpdate {
    Started,
    Succeeded { size: i64, duration_ms: i64 },
    RetryableFailure { message: String },
    PermanentFailure { message: String },
    Requeued,
}

impl StatusUpdate {
    pub fn target(&self) -> JobStatus {
        match self {
            StatusUpdate::Started => JobStatus::Running,
            StatusUpdate::Succeeded { .. } => JobStatus::Success,
            StatusUpdate::RetryableFailure { .. } => JobStatus::RetryableFailed,
            StatusUpdate::PermanentFailure { .. } => JobStatus::PermanentFailed,
            StatusUpdate::Requeued => JobStatus::Queued,
        }
    }
}
