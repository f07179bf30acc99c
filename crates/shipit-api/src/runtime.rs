//! Process wiring: builds the store, queue, bus, launcher and workers from
//! the system configuration.

use anyhow::{Context, bail};
use shipit_config::{
    BusBackend, LauncherBackend, QueueBackend, SystemConfig, load_system_config,
};
use shipit_core::StatusReporter;
use shipit_core::bus::LogBus;
use shipit_core::launcher::Launcher;
use shipit_db::{JobStore, MemoryJobStore, PgJobStore};
use shipit_executor::{
    DockerLauncher, ExecutionMonitor, FailureClassifier, LocalLauncher, MonitorSettings,
    OutcomeReceiver, ProcessLauncher, forward_outcomes, sink_from_config,
};
use shipit_scheduler::{
    BuildOrchestrator, DispatchQueue, InMemoryLogBus, MemoryDispatchQueue, PgDispatchQueue,
    PgLogBus, RetryPolicy, Worker,
};
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::AppState;

/// Environment variable carrying the database URL into launched monitors.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Environment variable carrying the config file path into launched monitors.
pub const CONFIG_ENV: &str = "SHIPIT_CONFIG";

/// Load the config file (defaults without one), apply the database URL
/// override and validate the result.
pub fn load_config(path: Option<&Path>, database_url: Option<String>) -> anyhow::Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(url) = database_url {
        config.database.url = Some(url);
    }
    config.validate()?;
    Ok(config)
}

/// Store, queue and bus handles for one process.
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn DispatchQueue>,
    pub bus: Arc<dyn LogBus>,
    pub pool: Option<PgPool>,
}

impl Backends {
    pub fn state(&self) -> AppState {
        AppState::new(self.store.clone(), self.queue.clone(), self.bus.clone())
    }
}

/// Connect the configured backends, running migrations on Postgres.
pub async fn connect_backends(config: &SystemConfig) -> anyhow::Result<Backends> {
    let policy = RetryPolicy::from(&config.queue);

    let pool = match config.database.backend {
        QueueBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url is required for the postgres backend")?;
            info!("Connecting to database...");
            let pool = shipit_db::create_pool(url, config.database.max_connections).await?;
            shipit_db::run_migrations(&pool).await?;
            info!("Database connected");
            Some(pool)
        }
        QueueBackend::Memory => None,
    };

    let (store, queue): (Arc<dyn JobStore>, Arc<dyn DispatchQueue>) = match &pool {
        Some(pool) => (
            Arc::new(PgJobStore::new(pool.clone())),
            Arc::new(PgDispatchQueue::new(
                pool.clone(),
                policy,
                config.queue.poll_interval,
            )),
        ),
        None => (
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryDispatchQueue::new(policy)),
        ),
    };

    let bus: Arc<dyn LogBus> = match (config.bus.backend, &pool) {
        (BusBackend::Postgres, Some(pool)) => {
            Arc::new(PgLogBus::connect(pool.clone(), config.bus.subscriber_buffer).await?)
        }
        (BusBackend::Postgres, None) => bail!("the postgres bus requires the postgres database"),
        (BusBackend::Memory, _) => Arc::new(InMemoryLogBus::new(config.bus.subscriber_buffer)),
    };

    info!(
        store = if pool.is_some() { "postgres" } else { "memory" },
        queue = queue.name(),
        bus = bus.name(),
        "Backends ready"
    );
    Ok(Backends {
        store,
        queue,
        bus,
        pool,
    })
}

/// The configured launcher. The local launcher also returns the channel its
/// outcomes arrive on, which must be passed to [`spawn_outcome_forwarder`].
pub fn build_launcher(
    config: &SystemConfig,
    bus: Arc<dyn LogBus>,
    config_path: Option<&str>,
) -> anyhow::Result<(Arc<dyn Launcher>, Option<OutcomeReceiver>)> {
    let forwarded = forwarded_env(config, config_path);

    Ok(match config.launcher.backend {
        LauncherBackend::Local => {
            let sink = sink_from_config(&config.artifacts)?;
            let monitor = Arc::new(ExecutionMonitor::new(
                MonitorSettings::from(&config.build),
                bus,
                sink,
                FailureClassifier::from_config(&config.classifier),
            ));
            let (launcher, outcomes) = LocalLauncher::new(monitor);
            (Arc::new(launcher), Some(outcomes))
        }
        LauncherBackend::Docker => {
            let launcher = forwarded
                .into_iter()
                .fold(DockerLauncher::new(&config.launcher)?, |l, (k, v)| {
                    l.with_env(k, v)
                });
            (Arc::new(launcher), None)
        }
        LauncherBackend::Process => {
            let launcher = forwarded
                .into_iter()
                .fold(ProcessLauncher::new(&config.launcher), |l, (k, v)| {
                    l.with_env(k, v)
                });
            (Arc::new(launcher), None)
        }
    })
}

/// What an out-of-process monitor needs to find the shared backends.
fn forwarded_env(config: &SystemConfig, config_path: Option<&str>) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(url) = &config.database.url {
        env.push((DATABASE_URL_ENV.to_string(), url.clone()));
    }
    if let Some(path) = config_path {
        env.push((CONFIG_ENV.to_string(), path.to_string()));
    }
    env
}

/// Forward local build outcomes to the orchestrator.
pub fn spawn_outcome_forwarder(
    outcomes: OutcomeReceiver,
    orchestrator: Arc<BuildOrchestrator>,
) -> JoinHandle<()> {
    let reporter: Arc<dyn StatusReporter> = orchestrator;
    tokio::spawn(forward_outcomes(outcomes, reporter))
}

/// Start `count` workers named `<prefix>-<n>`.
pub fn spawn_workers(
    orchestrator: Arc<BuildOrchestrator>,
    count: usize,
    prefix: &str,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|n| {
            let worker = Worker::new(
                format!("{}-{}", prefix, n),
                orchestrator.clone(),
                shutdown.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect()
}

/// Resolves once Ctrl-C is received.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipit_core::{BuildId, Job, JobStatus};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_backends_run_a_build_end_to_end() {
        let dir = std::env::temp_dir().join(format!("shipit-runtime-{}", BuildId::generate()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = SystemConfig::default();
        config.build.command = "mkdir -p dist && echo hi > dist/index.html".to_string();
        config.build.source_dir = dir.clone();
        config.build.work_dir = dir.join("builds");
        config.build.log_file = dir.join("build.log");
        config.artifacts = shipit_config::ArtifactsConfig::Fs {
            root: dir.join("store"),
        };

        let backends = connect_backends(&config).await.unwrap();
        let (launcher, outcomes) = build_launcher(&config, backends.bus.clone(), None).unwrap();
        let orchestrator = Arc::new(BuildOrchestrator::new(
            backends.store.clone(),
            backends.queue.clone(),
            backends.bus.clone(),
            launcher,
        ));
        let forwarder = spawn_outcome_forwarder(outcomes.unwrap(), orchestrator.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = spawn_workers(orchestrator, 2, "test", shutdown_rx);

        let id = BuildId::parse("e2e").unwrap();
        let job = Job::new(id.clone(), "https://x.test/r.git", None, BTreeMap::new());
        backends.store.insert(&job).await.unwrap();
        backends.queue.enqueue(&id, 1).await.unwrap();

        let mut status = JobStatus::Queued;
        for _ in 0..100 {
            status = backends.store.get(&id).await.unwrap().status;
            if status == JobStatus::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, JobStatus::Success);
        assert!(dir.join("store/outputs/e2e/index.html").exists());

        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
        forwarder.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_postgres_bus_without_database_fails() {
        let mut config = SystemConfig::default();
        config.bus.backend = BusBackend::Postgres;
        assert!(connect_backends(&config).await.is_err());
    }
}
