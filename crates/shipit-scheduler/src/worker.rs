//! Worker that pulls deliveries from the dispatch queue.

use crate::orchestrator::{BuildOrchestrator, DispatchResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A worker that claims deliveries and hands them to the orchestrator.
pub struct Worker {
    id: String,
    orchestrator: Arc<BuildOrchestrator>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        orchestrator: Arc<BuildOrchestrator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: id.into(),
            orchestrator,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until shutdown is signalled.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "Starting worker");
        let queue = self.orchestrator.queue().clone();

        while !*self.shutdown.borrow() {
            match queue.claim(&self.id).await {
                Ok(Some(delivery)) => {
                    info!(
                        worker_id = %self.id,
                        job_id = %delivery.build_id,
                        attempt = delivery.attempt,
                        "Claimed job"
                    );
                    let result = self.orchestrator.dispatch(&delivery).await;
                    debug!(worker_id = %self.id, job_id = %delivery.build_id, ?result, "Dispatch finished");
                    if matches!(result, DispatchResult::Released) {
                        // Store trouble; back off before claiming again.
                        self.pause(Duration::from_secs(5)).await;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = queue.wait_for_work() => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    self.pause(Duration::from_secs(5)).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
