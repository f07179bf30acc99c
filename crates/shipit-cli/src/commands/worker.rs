//! Standalone dispatch workers.

use anyhow::{Result, bail};
use shipit_api::runtime;
use shipit_config::QueueBackend;
use shipit_scheduler::BuildOrchestrator;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub async fn run(
    config_path: Option<&Path>,
    database_url: Option<String>,
    workers: Option<usize>,
) -> Result<()> {
    let mut config = runtime::load_config(config_path, database_url)?;
    if let Some(workers) = workers {
        config.server.workers = workers;
    }
    config.validate()?;
    // An in-memory queue would only ever see this process's own submissions.
    if config.database.backend != QueueBackend::Postgres {
        bail!("standalone workers require the postgres database backend");
    }

    let backends = runtime::connect_backends(&config).await?;
    let config_path = config_path.map(|p| p.display().to_string());
    let (launcher, outcomes) =
        runtime::build_launcher(&config, backends.bus.clone(), config_path.as_deref())?;
    let orchestrator = Arc::new(BuildOrchestrator::new(
        backends.store.clone(),
        backends.queue.clone(),
        backends.bus.clone(),
        launcher,
    ));
    let forwarder = outcomes.map(|rx| runtime::spawn_outcome_forwarder(rx, orchestrator.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prefix = format!("worker-{}", std::process::id());
    let handles = runtime::spawn_workers(orchestrator, config.server.workers, &prefix, shutdown_rx);
    info!(count = handles.len(), "Workers running, press Ctrl-C to stop");

    runtime::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        warn!("Workers already stopped");
    }
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task failed");
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    Ok(())
}
