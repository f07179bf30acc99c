//! Launcher trait: the compute substrate that runs a build.
//!
//! The orchestrator only cares whether the launch request was accepted.
//! Completion is reported out-of-band by the execution monitor running inside
//! the launched environment, identified by the build id it receives in its
//! environment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{BuildId, Result};

/// Environment variable carrying the build id into the launched environment.
pub const BUILD_ID_ENV: &str = "BUILD_ID";
/// Same value as [`BUILD_ID_ENV`], kept for build images that read the project id.
pub const PROJECT_ID_ENV: &str = "PROJECT_ID";
/// Environment variable carrying the repository URL.
pub const REPO_URL_ENV: &str = "GIT_REPOSITORY_URL";

/// What to launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub id: BuildId,
    pub repo_url: String,
    pub env_vars: BTreeMap<String, String>,
}

impl LaunchRequest {
    /// Full environment for the launched process: user variables plus the
    /// reserved shipit variables, which always win.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env_vars.clone();
        env.insert(BUILD_ID_ENV.to_string(), self.id.to_string());
        env.insert(PROJECT_ID_ENV.to_string(), self.id.to_string());
        env.insert(REPO_URL_ENV.to_string(), self.repo_url.clone());
        env
    }
}

/// Opaque handle returned by a launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: BuildId,
    /// Launcher-specific identifier (container id, pid, ...).
    pub task_id: String,
    pub launcher: String,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Name of this launcher.
    fn name(&self) -> &'static str;

    /// Start a build. Errors are launch-infrastructure failures.
    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle>;
}
