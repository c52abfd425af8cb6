use async_trait::async_trait;
use bollard::errors::Error as RuntimeError;
use bollard::models::{ContainerCreateBody, ContainerState, VolumeCreateOptions};
use bollard::query_parameters::{
    AttachContainerOptions, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RemoveVolumeOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use dockbox_core::{DockboxError, EngineConfig, Result};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::traits::{ArchiveStream, Attachment, ContainerRuntime, OutputStream};

/// Seconds bollard waits on a single request before giving up.
const REQUEST_TIMEOUT: u64 = 120;

/// Seconds the daemon waits after SIGTERM before killing a stopped container.
/// The shell running as PID 1 ignores SIGTERM, so any grace period is dead time.
const STOP_GRACE_SECONDS: i32 = 0;

/// [`ContainerRuntime`] backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects to the daemon named by `docker_host`: a `unix://` socket, or
    /// an HTTP(S) endpoint. With TLS verification on, the certificates are read
    /// from `docker_config` (or `DOCKER_CERT_PATH` when unset).
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let host = config.docker_host.as_str();
        info!("Connecting to container runtime at {}", host);

        let docker = if config.docker_tls_verify {
            match &config.docker_config {
                Some(certs) => Docker::connect_with_ssl(
                    host,
                    &certs.join("key.pem"),
                    &certs.join("cert.pem"),
                    &certs.join("ca.pem"),
                    REQUEST_TIMEOUT,
                    API_DEFAULT_VERSION,
                ),
                None => Docker::connect_with_ssl_defaults(),
            }
        } else if host.starts_with("unix://") {
            Docker::connect_with_unix(host, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(host, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
        }
        .map_err(|e| DockboxError::runtime("connect", e))?;

        Ok(Self::new(docker))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, body))]
    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> std::result::Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), body).await?;
        for warning in &response.warnings {
            debug!("Runtime warning for {}: {}", name, warning);
        }

        Ok(response.id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(STOP_GRACE_SECONDS),
            ..Default::default()
        };
        self.docker.stop_container(id, Some(options)).await
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> std::result::Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await
    }

    #[instrument(skip(self))]
    async fn inspect_container(
        &self,
        id: &str,
    ) -> std::result::Result<ContainerState, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        Ok(response.state.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn list_containers(
        &self,
        ids: &[String],
    ) -> std::result::Result<Vec<String>, RuntimeError> {
        // An empty id filter would match every container on the host
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let options = ListContainersOptions {
            all: true,
            filters: Some(HashMap::from([("id".to_string(), ids.to_vec())])),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    #[instrument(skip(self))]
    async fn create_volume(&self, name: &str) -> std::result::Result<(), RuntimeError> {
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_volume(&self, name: &str) -> std::result::Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
    }

    #[instrument(skip(self, archive))]
    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> std::result::Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), bollard::body_try_stream(archive))
            .await
    }

    #[instrument(skip(self))]
    async fn attach_container(&self, id: &str) -> std::result::Result<Attachment, RuntimeError> {
        let options = AttachContainerOptions {
            stdin: true,
            stdout: true,
            stderr: true,
            stream: true,
            logs: true,
            ..Default::default()
        };
        let results = self.docker.attach_container(id, Some(options)).await?;

        Ok(Attachment {
            output: results.output,
            input: results.input,
        })
    }

    fn follow_logs(&self, id: &str) -> OutputStream {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker.logs(id, Some(options)).boxed()
    }
}
