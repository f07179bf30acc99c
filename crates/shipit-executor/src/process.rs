//! Process launcher: runs the monitor as a child process on this host.

use async_trait::async_trait;
use shipit_config::LauncherConfig;
use shipit_core::launcher::{LaunchRequest, Launcher, TaskHandle};
use shipit_core::{Error, Result};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    forwarded_env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            forwarded_env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.forwarded_env.insert(key.into(), value.into());
        self
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut env = request.environment();
        env.extend(self.forwarded_env.clone());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle> {
        let mut child = self.command(&request).spawn().map_err(|e| {
            Error::LaunchFailed(format!("Failed to start {}: {}", self.program, e))
        })?;
        let pid = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "exited".to_string());
        info!(job_id = %request.id, pid = %pid, program = %self.program, "Started monitor process");

        // The monitor reports its own outcome; reap it so it does not linger.
        let id = request.id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(job_id = %id, status = %status, "Monitor process exited abnormally"),
                Err(e) => warn!(job_id = %id, error = %e, "Failed to wait for monitor process"),
            }
        });

        Ok(TaskHandle {
            id: request.id,
            task_id: pid,
            launcher: self.name().to_string(),
        })
    }
}
