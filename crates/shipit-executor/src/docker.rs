//! Docker launcher: one container per build, running the monitor image.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, StartContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use shipit_config::LauncherConfig;
use shipit_core::launcher::{LaunchRequest, Launcher, TaskHandle};
use shipit_core::{BuildId, Error, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Label carrying the build id on every container we start.
pub const BUILD_ID_LABEL: &str = "shipit.build-id";

pub struct DockerLauncher {
    docker: Docker,
    image: String,
    network: Option<String>,
    /// Extra variables every container gets, e.g. the database URL the
    /// monitor reports through.
    forwarded_env: BTreeMap<String, String>,
}

impl DockerLauncher {
    /// Connect to the local Docker daemon.
    pub fn new(config: &LauncherConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker, config))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, config: &LauncherConfig) -> Self {
        Self {
            docker,
            image: config.image.clone(),
            network: config.network.clone(),
            forwarded_env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.forwarded_env.insert(key.into(), value.into());
        self
    }

    /// Unique per launch, so a retried build never collides with the
    /// container of an earlier attempt that is still being removed.
    fn container_name(id: &BuildId) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("shipit-build-{}-{}", id, &suffix[..8])
    }

    /// Container environment. Forwarded variables win over the build's own.
    fn container_env(&self, request: &LaunchRequest) -> Vec<String> {
        let mut env = request.environment();
        env.extend(self.forwarded_env.clone());
        env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    fn container_config(&self, request: &LaunchRequest) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(BUILD_ID_LABEL.to_string(), request.id.to_string());

        let host_config = HostConfig {
            auto_remove: Some(true),
            network_mode: self.network.clone(),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            env: Some(self.container_env(request)),
            labels: Some(labels),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn pull_image(&self) {
        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                // Locally built images are not in any registry.
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle> {
        self.pull_image().await;

        let container_name = Self::container_name(&request.id);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, job_id = %request.id, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(&request))
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to start container: {}", e)))?;

        Ok(TaskHandle {
            id: request.id,
            task_id: container.id,
            launcher: self.name().to_string(),
        })
    }
}
