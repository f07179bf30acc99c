//! KDL configuration parsing for shipit.
//!
//! A single `shipit.kdl` file configures the server, database, log bus,
//! dispatch queue, launcher, build execution, artifact storage and failure
//! classification. Every section is optional.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ArtifactsConfig, BuildConfig, BusBackend, BusConfig, ClassifierConfig, DatabaseConfig,
    LauncherBackend, LauncherConfig, QueueBackend, QueueConfig, ServerConfig, SystemConfig,
    load_system_config, parse_system_config,
};
