//! In-process launcher: runs the execution monitor as a tokio task and hands
//! outcomes back over a channel.

use async_trait::async_trait;
use shipit_core::launcher::{LaunchRequest, Launcher, TaskHandle};
use shipit_core::{BuildId, BuildOutcome, Error, Result, StatusReporter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::monitor::ExecutionMonitor;

/// Outcomes queued between finished local builds and the reporter.
const OUTCOME_BUFFER: usize = 64;

pub type OutcomeReceiver = mpsc::Receiver<(BuildId, BuildOutcome)>;

pub struct LocalLauncher {
    monitor: Arc<ExecutionMonitor>,
    outcomes: mpsc::Sender<(BuildId, BuildOutcome)>,
}

impl LocalLauncher {
    /// The receiver must be drained, usually with [`forward_outcomes`].
    pub fn new(monitor: Arc<ExecutionMonitor>) -> (Self, OutcomeReceiver) {
        let (outcomes, rx) = mpsc::channel(OUTCOME_BUFFER);
        (Self { monitor, outcomes }, rx)
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle> {
        if self.outcomes.is_closed() {
            return Err(Error::LaunchFailed("outcome reporter has stopped".into()));
        }

        let task_id = uuid::Uuid::now_v7().to_string();
        let monitor = self.monitor.clone();
        let outcomes = self.outcomes.clone();
        let id = request.id.clone();
        info!(job_id = %id, task_id = %task_id, "Starting local build");

        tokio::spawn(async move {
            let outcome = monitor.run_isolated(&request).await;
            if outcomes.send((request.id.clone(), outcome)).await.is_err() {
                warn!(job_id = %request.id, "Outcome dropped, reporter has stopped");
            }
        });

        Ok(TaskHandle {
            id,
            task_id,
            launcher: self.name().to_string(),
        })
    }
}

/// Hand every outcome to `reporter` until all launchers are gone.
pub async fn forward_outcomes(mut rx: OutcomeReceiver, reporter: Arc<dyn StatusReporter>) {
    while let Some((id, outcome)) = rx.recv().await {
        if let Err(e) = reporter.report(&id, outcome).await {
            error!(job_id = %id, error = %e, "Failed to record build outcome");
        }
    }
}
