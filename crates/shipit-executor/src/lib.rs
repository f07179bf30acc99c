//! Build execution for shipit.
//!
//! - Execution monitor: runs the build command, streams logs, uploads output
//! - Failure classification
//! - Launchers: in-process (local), Docker, child process
//! - Artifact sinks: filesystem and HTTP object store

pub mod artifacts;
pub mod classify;
pub mod docker;
pub mod local;
pub mod monitor;
pub mod process;

pub use artifacts::{ArtifactError, FsArtifactSink, HttpArtifactSink, sink_from_config};
pub use classify::{ArtifactResult, DEFAULT_RETRYABLE_MARKERS, FailureClassifier};
pub use docker::DockerLauncher;
pub use local::{LocalLauncher, OutcomeReceiver, forward_outcomes};
pub use monitor::{ExecutionMonitor, MonitorSettings};
pub use process::ProcessLauncher;
