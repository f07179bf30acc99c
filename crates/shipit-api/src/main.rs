//! shipit API server: submission API, log gateway and dispatch workers.

use clap::Parser;
use shipit_api::logging::{LogFormat, init_tracing};
use shipit_api::{routes, runtime};
use shipit_scheduler::BuildOrchestrator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shipit-server")]
#[command(about = "shipit build orchestrator server", long_about = None)]
struct Args {
    /// Path to the KDL system configuration
    #[arg(long, env = "SHIPIT_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the config file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address, overriding the config file
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Number of dispatch workers, overriding the config file
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = runtime::load_config(args.config.as_deref(), args.database_url)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    config.validate()?;

    let backends = runtime::connect_backends(&config).await?;
    let config_path = args.config.as_ref().map(|p| p.display().to_string());
    let (launcher, outcomes) =
        runtime::build_launcher(&config, backends.bus.clone(), config_path.as_deref())?;
    info!(launcher = launcher.name(), "Launcher ready");

    let orchestrator = Arc::new(BuildOrchestrator::new(
        backends.store.clone(),
        backends.queue.clone(),
        backends.bus.clone(),
        launcher,
    ));
    let forwarder = outcomes.map(|rx| runtime::spawn_outcome_forwarder(rx, orchestrator.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = runtime::spawn_workers(
        orchestrator,
        config.server.workers,
        "server",
        shutdown_rx,
    );

    // Build router
    let app = routes::router(backends.state())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal())
        .await?;

    info!("Stopping workers");
    if shutdown_tx.send(true).is_err() {
        warn!("Workers already stopped");
    }
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task failed");
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    Ok(())
}
