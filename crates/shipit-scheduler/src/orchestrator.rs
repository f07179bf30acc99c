//! Build orchestrator: drives a job through its lifecycle.
//!
//! Every transition is persisted before the matching status line is
//! published, so a subscriber never sees a status the store does not have.
//! Store failures are logged and swallowed; a worker never dies because of
//! one job.

use async_trait::async_trait;
use shipit_core::bus::LogBus;
use shipit_core::launcher::{LaunchRequest, Launcher, TaskHandle};
use shipit_core::{BuildId, BuildOutcome, Job, JobStatus, StatusReporter, StatusUpdate};
use shipit_db::{DbError, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::queue::{Delivery, DispatchQueue, RetryDecision};

/// What happened to a claimed delivery.
#[derive(Debug)]
pub enum DispatchResult {
    /// The launcher accepted the build; the delivery stays claimed until the
    /// outcome is reported.
    Launched(TaskHandle),
    /// The job was not queued (stale or duplicate delivery).
    Skipped,
    /// The launcher refused; recorded as a retryable failure.
    LaunchFailed(String),
    /// Infrastructure error before the job was started; delivery put back.
    Released,
}

/// Records build outcomes: the store, queue and bus half of the orchestrator.
///
/// Needs no launcher, so an execution monitor in another process can record
/// its own outcome against the shared database.
pub struct OutcomeRecorder {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn DispatchQueue>,
    bus: Arc<dyn LogBus>,
}

impl OutcomeRecorder {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        bus: Arc<dyn LogBus>,
    ) -> Self {
        Self { store, queue, bus }
    }

    /// Persist a status update, then announce it. `None` if nothing changed.
    async fn transition(&self, id: &BuildId, update: &StatusUpdate) -> Option<Job> {
        match self.store.update_status(id, update).await {
            Ok(job) => {
                info!(job_id = %id, status = %job.status, "Job status updated");
                self.announce(id, &format!("Job status updated: {}", job.status))
                    .await;
                Some(job)
            }
            Err(DbError::InvalidTransition { from, to }) => {
                warn!(job_id = %id, %from, %to, "Ignoring stale status update");
                None
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to update job status");
                None
            }
        }
    }

    async fn announce(&self, id: &BuildId, line: &str) {
        if let Err(e) = self.bus.publish_line(id, line).await {
            warn!(job_id = %id, error = %e, "Failed to publish status line");
        }
    }

    /// Record the terminal outcome of the running attempt of `id`.
    pub async fn record(&self, id: &BuildId, outcome: BuildOutcome) {
        let job = match self.store.get(id).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %id, error = %e, "Cannot record outcome");
                return;
            }
        };
        if job.status != JobStatus::Running {
            info!(job_id = %id, status = %job.status, "Ignoring outcome for job that is not running");
            return;
        }

        let delivery = match self.queue.active_delivery(id).await {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to look up delivery");
                None
            }
        };

        let Some(updated) = self.transition(id, &outcome.to_update()).await else {
            return;
        };
        if let Some(reason) = outcome.reason() {
            self.announce(id, reason).await;
        }

        match outcome {
            BuildOutcome::Success { .. } | BuildOutcome::PermanentFailure { .. } => {
                if let Some(delivery) = delivery {
                    self.finish(&delivery).await;
                }
            }
            BuildOutcome::RetryableFailure { .. } => {
                self.schedule_retry(&updated, delivery.as_ref()).await;
            }
        }
    }

    async fn finish(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.complete(delivery).await {
            error!(job_id = %delivery.build_id, error = %e, "Failed to complete delivery");
        }
    }

    /// The job is back to `queued` before its delivery can be claimed again.
    /// If that write fails, `dispatch` requeues the job when it claims the
    /// delivery.
    async fn schedule_retry(&self, job: &Job, delivery: Option<&Delivery>) {
        let policy = *self.queue.policy();

        if !policy.should_retry(job.retry_count) {
            if let Some(delivery) = delivery {
                self.finish(delivery).await;
            }
            warn!(job_id = %job.id, retry_count = job.retry_count, "Retry limit reached");
            self.announce(
                &job.id,
                &format!("Retry limit reached after {} failures", job.retry_count),
            )
            .await;
            return;
        }

        let attempt = job.retry_count + 1;
        let delay = match delivery {
            Some(_) => policy.delay_for(job.retry_count),
            // No claimed delivery to reschedule (lost with an in-memory queue).
            None => Duration::ZERO,
        };
        self.transition(&job.id, &StatusUpdate::Requeued).await;
        self.announce(
            &job.id,
            &format!(
                "Retrying in {} ms (attempt {} of {})",
                delay.as_millis(),
                attempt,
                policy.max_attempts + 1
            ),
        )
        .await;

        let scheduled = match delivery {
            Some(delivery) => self.queue.retry(delivery, job.retry_count).await,
            None => self
                .queue
                .enqueue(&job.id, attempt)
                .await
                .map(|receipt| RetryDecision::Scheduled {
                    attempt: receipt.attempt,
                    delay,
                }),
        };
        match scheduled {
            Ok(RetryDecision::Scheduled { attempt, delay }) => {
                info!(job_id = %job.id, attempt, ?delay, "Retry scheduled");
            }
            Ok(RetryDecision::Exhausted) => {
                warn!(job_id = %job.id, retry_count = job.retry_count, "Queue refused the retry");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to schedule retry");
            }
        }
    }
}

#[async_trait]
impl StatusReporter for OutcomeRecorder {
    async fn report(&self, id: &BuildId, outcome: BuildOutcome) -> shipit_core::Result<()> {
        self.record(id, outcome).await;
        Ok(())
    }
}

/// Dispatches claimed deliveries to the launcher and records outcomes.
pub struct BuildOrchestrator {
    recorder: OutcomeRecorder,
    launcher: Arc<dyn Launcher>,
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn DispatchQueue>,
        bus: Arc<dyn LogBus>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            recorder: OutcomeRecorder::new(store, queue, bus),
            launcher,
        }
    }

    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.recorder.queue
    }

    /// Start the job behind a claimed delivery.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchResult {
        let id = &delivery.build_id;
        let store = &self.recorder.store;

        let job = match store.get(id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                warn!(job_id = %id, "Delivery for unknown job, dropping");
                self.recorder.finish(delivery).await;
                return DispatchResult::Skipped;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to load job");
                self.release(delivery).await;
                return DispatchResult::Released;
            }
        };

        // A retry delivery can be claimed before its `Requeued` write lands.
        if job.status == JobStatus::RetryableFailed {
            self.recorder.transition(id, &StatusUpdate::Requeued).await;
        } else if job.status != JobStatus::Queued {
            info!(job_id = %id, status = %job.status, "Job is not queued, skipping delivery");
            self.recorder.finish(delivery).await;
            return DispatchResult::Skipped;
        }

        match store.update_status(id, &StatusUpdate::Started).await {
            Ok(_) => {}
            Err(DbError::InvalidTransition { from, .. }) => {
                info!(job_id = %id, status = %from, "Job moved before start, skipping delivery");
                self.recorder.finish(delivery).await;
                return DispatchResult::Skipped;
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to mark job running");
                self.release(delivery).await;
                return DispatchResult::Released;
            }
        }
        info!(job_id = %id, attempt = delivery.attempt, launcher = self.launcher.name(), "Job started");
        self.recorder
            .announce(id, &format!("Job status updated: {}", JobStatus::Running))
            .await;

        let request = LaunchRequest {
            id: job.id.clone(),
            repo_url: job.repo_url.clone(),
            env_vars: job.env_vars.clone(),
        };
        match self.launcher.launch(request).await {
            Ok(handle) => {
                info!(job_id = %id, task_id = %handle.task_id, "Build launched");
                DispatchResult::Launched(handle)
            }
            Err(e) => {
                let reason = format!("Failed to launch build: {}", e);
                warn!(job_id = %id, error = %e, "Launch failed");
                // The delivery is still claimed, so retry handling finds it.
                self.recorder
                    .record(
                        id,
                        BuildOutcome::RetryableFailure {
                            reason: reason.clone(),
                        },
                    )
                    .await;
                DispatchResult::LaunchFailed(reason)
            }
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.recorder.queue.release(delivery).await {
            error!(job_id = %delivery.build_id, error = %e, "Failed to release delivery");
        }
    }

    /// Record a build outcome reported by the execution monitor.
    pub async fn report(&self, id: &BuildId, outcome: BuildOutcome) {
        self.recorder.record(id, outcome).await;
    }
}

#[async_trait]
impl StatusReporter for BuildOrchestrator {
    async fn report(&self, id: &BuildId, outcome: BuildOutcome) -> shipit_core::Result<()> {
        self.recorder.record(id, outcome).await;
        Ok(())
    }
}
