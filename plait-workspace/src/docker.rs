//! Docker isolation: one container per agent with a writable workspace mount,
//! read-only temp-workspace/context mounts, resource caps and no network by
//! default. MCP servers either run on the host against the mounted paths or
//! inside the container via the docker-exec rewrite in [`crate::inject`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::manager::WorkspaceError;

/// Resource caps applied to every agent container.
#[derive(Clone, Copy, Debug)]
pub struct DockerResources {
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

impl Default for DockerResources {
    fn default() -> Self {
        Self {
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            nano_cpus: Some(2_000_000_000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DockerManagerConfig {
    pub image: String,
    /// Docker network mode; `none` keeps agents offline unless opted in.
    pub network_mode: String,
    pub resources: DockerResources,
    /// Pull the image when it is missing locally.
    pub autopull: bool,
}

impl Default for DockerManagerConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            network_mode: "none".to_string(),
            resources: DockerResources::default(),
            autopull: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("docker connect: {0}")]
    Connect(String),
    #[error("docker image: {0}")]
    Image(String),
    #[error("docker container: {0}")]
    Container(String),
}

impl From<DockerError> for WorkspaceError {
    fn from(err: DockerError) -> Self {
        WorkspaceError::Io(std::io::Error::other(err.to_string()))
    }
}

/// Name for a container created before its agent id is known: the
/// MCP-inside-Docker flow needs the container up before server specs are
/// generated.
pub fn early_container_name() -> String {
    format!("plait-early-{}", uuid::Uuid::new_v4().simple())
}

/// Supervises the per-agent containers.
pub struct DockerManager {
    docker: Docker,
    config: DockerManagerConfig,
}

impl DockerManager {
    pub fn new(config: DockerManagerConfig) -> Result<Self, DockerError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| DockerError::Connect(e.to_string()))?;
        Ok(Self { docker, config })
    }

    async fn ensure_image(&self) -> Result<(), DockerError> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }
        if !self.config.autopull {
            return Err(DockerError::Image(format!(
                "image {} not found locally and autopull is disabled",
                self.config.image
            )));
        }
        info!(image = %self.config.image, "pulling image");
        let options = bollard::image::CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(step) = pull.next().await {
            step.map_err(|e| DockerError::Image(format!("pull {}: {}", self.config.image, e)))?;
        }
        Ok(())
    }

    /// Creates and starts a container for one agent.
    ///
    /// Mounts: workspace read-write at `/workspace`, temp workspace read-only
    /// at `/temp_workspaces`, each context path read-only under `/context/<i>`.
    /// Returns the container name (`plait-<agent-id>`).
    pub async fn create_container(
        &self,
        agent_id: &str,
        workspace: &Path,
        temp_workspace: Option<&Path>,
        context_paths: &[PathBuf],
        env: &HashMap<String, String>,
    ) -> Result<String, DockerError> {
        self.ensure_image().await?;

        let mut binds = vec![format!("{}:/workspace", workspace.display())];
        if let Some(temp) = temp_workspace {
            binds.push(format!("{}:/temp_workspaces:ro", temp.display()));
        }
        for (index, context) in context_paths.iter().enumerate() {
            binds.push(format!("{}:/context/{}:ro", context.display(), index));
        }

        let host_config = bollard::service::HostConfig {
            binds: Some(binds),
            network_mode: Some(self.config.network_mode.clone()),
            memory: self.config.resources.memory_bytes,
            nano_cpus: self.config.resources.nano_cpus,
            ..Default::default()
        };

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let container_config = Config {
            image: Some(self.config.image.clone()),
            tty: Some(true),
            working_dir: Some("/workspace".to_string()),
            env: Some(env),
            // Keep the container alive; work happens via docker exec.
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("plait-{}", agent_id);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DockerError::Container(format!("create {}: {}", name, e)))?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::Container(format!("start {}: {}", name, e)))?;

        info!(container = %name, image = %self.config.image, "agent container started");
        Ok(name)
    }

    /// Stops and removes a container; tolerates it already being gone.
    pub async fn stop_and_remove(&self, container_name: &str) {
        if let Err(e) = self
            .docker
            .stop_container(container_name, Some(StopContainerOptions { t: 5 }))
            .await
        {
            warn!(container = container_name, error = %e, "stop failed");
        }
        if let Err(e) = self
            .docker
            .remove_container(
                container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = container_name, error = %e, "remove failed");
        }
    }
}
