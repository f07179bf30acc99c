//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub queue: QueueConfig,
    pub launcher: LauncherConfig,
    pub build: BuildConfig,
    pub artifacts: ArtifactsConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Number of in-process dispatch workers.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            workers: 2,
        }
    }
}

/// Where the job store and dispatch queue live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: QueueBackend,
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Lines buffered per subscriber before new lines are dropped for it.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            subscriber_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// How long an idle Postgres-backed worker sleeps between claims.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherBackend {
    /// Run the execution monitor as a task inside the server process.
    #[default]
    Local,
    Docker,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub backend: LauncherBackend,
    /// Build image for the docker launcher.
    pub image: String,
    pub network: Option<String>,
    /// Program and arguments for the process launcher.
    pub program: String,
    pub args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: LauncherBackend::Local,
            image: "shipit-builder:latest".to_string(),
            network: None,
            program: "shipit".to_string(),
            args: vec!["monitor".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Shell command producing the build output.
    pub command: String,
    /// Checked-out source tree the command runs in.
    pub source_dir: PathBuf,
    /// Output directory, relative to `source_dir`.
    pub output_dir: String,
    /// Parent of the per-build working copies of `source_dir`.
    pub work_dir: PathBuf,
    /// Transcript file, relative to the monitor's working directory.
    pub log_file: PathBuf,
    pub timeout: Option<Duration>,
    pub upload_timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: "npm install && npm run build".to_string(),
            source_dir: PathBuf::from("output"),
            output_dir: "dist".to_string(),
            work_dir: PathBuf::from("builds"),
            log_file: PathBuf::from("build.log"),
            timeout: None,
            upload_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ArtifactsConfig {
    Fs { root: PathBuf },
    Http { base_url: String },
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        ArtifactsConfig::Fs {
            root: PathBuf::from("artifacts"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Replaces the built-in transient-failure markers when set.
    pub markers: Option<Vec<String>>,
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => parse_server(node, &mut config.server)?,
            "database" => parse_database(node, &mut config.database)?,
            "bus" => parse_bus(node, &mut config.bus)?,
            "queue" => parse_queue(node, &mut config.queue)?,
            "launcher" => parse_launcher(node, &mut config.launcher)?,
            "build" => parse_build(node, &mut config.build)?,
            "artifacts" => config.artifacts = parse_artifacts(node)?,
            "classifier" => parse_classifier(node, &mut config.classifier)?,
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

impl SystemConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.workers == 0 {
            return Err(invalid("server.workers", "must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(invalid("queue.max-attempts", "must be at least 1"));
        }
        if self.bus.subscriber_buffer == 0 {
            return Err(invalid("bus.subscriber-buffer", "must be at least 1"));
        }
        if self.build.command.trim().is_empty() {
            return Err(ConfigError::MissingField("build.command".to_string()));
        }
        if self.bus.backend == BusBackend::Postgres && self.database.backend != QueueBackend::Postgres
        {
            return Err(invalid(
                "bus.backend",
                "postgres bus requires database backend \"postgres\"",
            ));
        }
        // Launched builds report back through the shared database and bus.
        if self.launcher.backend != LauncherBackend::Local
            && (self.database.backend != QueueBackend::Postgres
                || self.bus.backend != BusBackend::Postgres)
        {
            return Err(invalid(
                "launcher.backend",
                "docker and process launchers require postgres database and bus backends",
            ));
        }
        if let ArtifactsConfig::Http { base_url } = &self.artifacts {
            url::Url::parse(base_url)
                .map_err(|e| invalid("artifacts.base-url", &e.to_string()))?;
        }
        Ok(())
    }
}

fn parse_server(node: &KdlNode, server: &mut ServerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "listen" => {
                let raw = required_string(child, "server.listen")?;
                server.listen = raw
                    .parse()
                    .map_err(|_| invalid("server.listen", &format!("not a socket address: {}", raw)))?;
            }
            "workers" => server.workers = required_int(child, "server.workers")?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_database(node: &KdlNode, database: &mut DatabaseConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "backend" => {
                database.backend = match required_string(child, "database.backend")?.as_str() {
                    "memory" => QueueBackend::Memory,
                    "postgres" => QueueBackend::Postgres,
                    other => return Err(unknown_backend("database.backend", other)),
                }
            }
            "url" => database.url = Some(required_string(child, "database.url")?),
            "max-connections" => {
                database.max_connections = required_int(child, "database.max-connections")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_bus(node: &KdlNode, bus: &mut BusConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "backend" => {
                bus.backend = match required_string(child, "bus.backend")?.as_str() {
                    "memory" => BusBackend::Memory,
                    "postgres" => BusBackend::Postgres,
                    other => return Err(unknown_backend("bus.backend", other)),
                }
            }
            "subscriber-buffer" => {
                bus.subscriber_buffer = required_int(child, "bus.subscriber-buffer")?
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_queue(node: &KdlNode, queue: &mut QueueConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-attempts" => queue.max_attempts = required_int(child, "queue.max-attempts")?,
            "base-delay-ms" => {
                queue.base_delay = Duration::from_millis(required_int(child, "queue.base-delay-ms")?)
            }
            "poll-interval-ms" => {
                queue.poll_interval =
                    Duration::from_millis(required_int(child, "queue.poll-interval-ms")?)
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_launcher(node: &KdlNode, launcher: &mut LauncherConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "backend" => {
                launcher.backend = match required_string(child, "launcher.backend")?.as_str() {
                    "local" => LauncherBackend::Local,
                    "docker" => LauncherBackend::Docker,
                    "process" => LauncherBackend::Process,
                    other => return Err(unknown_backend("launcher.backend", other)),
                }
            }
            "image" => launcher.image = required_string(child, "launcher.image")?,
            "network" => launcher.network = Some(required_string(child, "launcher.network")?),
            "program" => launcher.program = required_string(child, "launcher.program")?,
            "args" => launcher.args = get_all_string_args(child),
            _ => {}
        }
    }
    Ok(())
}

fn parse_build(node: &KdlNode, build: &mut BuildConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "command" => build.command = required_string(child, "build.command")?,
            "source-dir" => build.source_dir = required_string(child, "build.source-dir")?.into(),
            "output-dir" => build.output_dir = required_string(child, "build.output-dir")?,
            "work-dir" => build.work_dir = required_string(child, "build.work-dir")?.into(),
            "log-file" => build.log_file = required_string(child, "build.log-file")?.into(),
            "timeout-secs" => {
                let secs: u64 = required_int(child, "build.timeout-secs")?;
                build.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "upload-timeout-secs" => {
                build.upload_timeout =
                    Duration::from_secs(required_int(child, "build.upload-timeout-secs")?)
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_artifacts(node: &KdlNode) -> ConfigResult<ArtifactsConfig> {
    let mut backend = String::from("fs");
    let mut root = None;
    let mut base_url = None;

    for child in children(node) {
        match child.name().value() {
            "backend" => backend = required_string(child, "artifacts.backend")?,
            "root" => root = Some(PathBuf::from(required_string(child, "artifacts.root")?)),
            "base-url" => base_url = Some(required_string(child, "artifacts.base-url")?),
            _ => {}
        }
    }

    match backend.as_str() {
        "fs" => Ok(ArtifactsConfig::Fs {
            root: root.unwrap_or_else(|| PathBuf::from("artifacts")),
        }),
        "http" => Ok(ArtifactsConfig::Http {
            base_url: base_url
                .ok_or_else(|| ConfigError::MissingField("artifacts.base-url".to_string()))?,
        }),
        other => Err(unknown_backend("artifacts.backend", other)),
    }
}

fn parse_classifier(node: &KdlNode, classifier: &mut ClassifierConfig) -> ConfigResult<()> {
    let mut markers = Vec::new();
    for child in children(node) {
        match child.name().value() {
            "marker" | "markers" => markers.extend(get_all_string_args(child)),
            _ => {}
        }
    }
    if !markers.is_empty() {
        classifier.markers = Some(markers);
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn required_int<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    let raw = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    T::try_from(raw).map_err(|_| invalid(field, &format!("{} is out of range", raw)))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn unknown_backend(field: &str, value: &str) -> ConfigError {
    invalid(field, &format!("unknown backend: {}", value))
}
