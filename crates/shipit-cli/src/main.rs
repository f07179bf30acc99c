//! shipit CLI tool.

use clap::{Parser, Subcommand};
use shipit_api::logging::{LogFormat, init_tracing};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "shipit")]
#[command(about = "shipit build orchestrator CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "SHIPIT_API_URL", default_value = "http://localhost:9000")]
    api_url: String,

    /// Path to the KDL system configuration
    #[arg(long, env = "SHIPIT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database URL, overriding the config file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a repository for building
    Submit {
        /// Git repository URL
        repo_url: String,
        /// Build id; generated by the server when omitted
        #[arg(long)]
        build_id: Option<String>,
        /// Submitter tag
        #[arg(long)]
        user_id: Option<String>,
        /// Build environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = commands::parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// Show one build, or the most recent ones
    Status {
        /// Build id
        id: Option<String>,
        /// Maximum number of builds to list
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Run dispatch workers against the shared database
    Worker {
        /// Number of workers, overriding the config file
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run one build inside a launched environment and record its outcome
    Monitor {
        /// Build to run
        #[arg(long, env = "BUILD_ID")]
        build_id: String,
    },
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "shipit.kdl")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Submit {
            repo_url,
            build_id,
            user_id,
            env,
        } => {
            commands::submit::submit(&cli.api_url, &repo_url, build_id, user_id, env).await?;
        }
        Commands::Status { id, limit } => match id {
            Some(id) => commands::status::show(&cli.api_url, &id).await?,
            None => commands::status::list(&cli.api_url, limit).await?,
        },
        Commands::Worker { workers } => {
            commands::worker::run(cli.config.as_deref(), cli.database_url, workers).await?;
        }
        Commands::Monitor { build_id } => {
            commands::monitor::run(cli.config.as_deref(), cli.database_url, &build_id).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
