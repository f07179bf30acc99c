//! Execution monitor entry point for launched build environments.

use anyhow::{Context, Result};
use shipit_api::runtime;
use shipit_core::launcher::LaunchRequest;
use shipit_core::{BuildId, StatusReporter};
use shipit_db::{JobStore, PgJobStore};
use shipit_executor::{ExecutionMonitor, FailureClassifier, MonitorSettings, sink_from_config};
use shipit_scheduler::{OutcomeRecorder, PgDispatchQueue, PgLogBus, RetryPolicy};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Run the build for `build_id` and record its outcome in the shared
/// database. The job itself supplies the repository and environment.
pub async fn run(config_path: Option<&Path>, database_url: Option<String>, build_id: &str) -> Result<()> {
    let config = runtime::load_config(config_path, database_url)?;
    let id = BuildId::parse(build_id)?;
    let url = config
        .database
        .url
        .as_deref()
        .context("the monitor needs DATABASE_URL to report its outcome")?;

    let pool = shipit_db::create_pool(url, 2).await?;
    let store = Arc::new(PgJobStore::new(pool.clone()));
    let queue = Arc::new(PgDispatchQueue::new(
        pool.clone(),
        RetryPolicy::from(&config.queue),
        config.queue.poll_interval,
    ));
    let bus = Arc::new(PgLogBus::publisher(pool));

    let job = store.get(&id).await?;
    let request = LaunchRequest {
        id: job.id.clone(),
        repo_url: job.repo_url.clone(),
        env_vars: job.env_vars.clone(),
    };

    let monitor = ExecutionMonitor::new(
        MonitorSettings::from(&config.build),
        bus.clone(),
        sink_from_config(&config.artifacts)?,
        FailureClassifier::from_config(&config.classifier),
    );
    let outcome = monitor.run_isolated(&request).await;
    info!(job_id = %id, outcome = ?outcome, "Recording outcome");

    let recorder = OutcomeRecorder::new(store, queue, bus);
    recorder.report(&id, outcome).await?;
    Ok(())
}
