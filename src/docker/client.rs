use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, ExecInspectResponse};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::DockerConfig;
use crate::gateway::{ByteStream, GatewayError};

/// Translates a bollard failure into the gateway taxonomy: 404s mean the
/// sandbox is gone, other daemon answers are runtime errors, and anything
/// that never reached the daemon means it is unavailable.
pub(super) fn map_err(err: BollardError) -> GatewayError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => GatewayError::NotFound(message),
        BollardError::DockerResponseServerError { message, .. } => GatewayError::Runtime(message),
        other => GatewayError::Unavailable(other.to_string()),
    }
}

pub struct DockerClient {
    config: DockerConfig,
    docker: OnceCell<Docker>,
}

impl DockerClient {
    /// The daemon is only contacted on first use, so an executor can boot
    /// before Docker is up and wait for it. Failed connects are retried on
    /// the next call.
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            config: config.clone(),
            docker: OnceCell::new(),
        }
    }

    async fn docker(&self) -> Result<&Docker, GatewayError> {
        self.docker
            .get_or_try_init(|| async {
                let docker = match &self.config.socket_path {
                    Some(socket) => {
                        Docker::connect_with_socket(socket, self.config.timeout_secs, API_DEFAULT_VERSION)
                    }
                    None => Docker::connect_with_socket_defaults(),
                }
                .map_err(map_err)?;
                debug!("Connected to Docker daemon");
                Ok(docker)
            })
            .await
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.docker().await?.ping().await.map_err(map_err)?;
        Ok(())
    }

    pub async fn mem_total(&self) -> Result<u64, GatewayError> {
        let info = self.docker().await?.info().await.map_err(map_err)?;
        Ok(info.mem_total.unwrap_or_default().max(0) as u64)
    }

    pub async fn ensure_image(&self, image: &str) -> Result<(), GatewayError> {
        if self.docker().await?.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling Docker image: {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker().await?.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(map_err)?;
            if let Some(status) = progress.status {
                debug!("Pull status: {}", status);
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    pub async fn create_container(&self, name: &str, config: Config<String>) -> Result<String, GatewayError> {
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let response = self
            .docker()
            .await?
            .create_container(Some(options), config)
            .await
            .map_err(map_err)?;

        info!("Created container {} with ID: {}", name, response.id);
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), GatewayError> {
        self.docker()
            .await?
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), GatewayError> {
        let options = StopContainerOptions { t: timeout_secs };
        match self.docker().await?.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), GatewayError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker()
            .await?
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)?;

        info!("Removed container: {}", id);
        Ok(())
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, GatewayError> {
        self.docker()
            .await?
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)
    }

    pub async fn list_containers(
        &self,
        label_filters: Vec<String>,
    ) -> Result<Vec<ContainerSummary>, GatewayError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        self.docker()
            .await?
            .list_containers(Some(options))
            .await
            .map_err(map_err)
    }

    /// Starts a detached exec and returns its id.
    pub async fn start_exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
        working_dir: Option<String>,
    ) -> Result<String, GatewayError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env),
            working_dir,
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };

        let docker = self.docker().await?;
        let exec = docker
            .create_exec(container_id, exec_config)
            .await
            .map_err(map_err)?;

        docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)?;

        Ok(exec.id)
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse, GatewayError> {
        self.docker().await?.inspect_exec(exec_id).await.map_err(map_err)
    }

    pub async fn download(&self, container_id: &str, path: &str) -> Result<ByteStream, GatewayError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        Ok(self
            .docker()
            .await?
            .download_from_container(container_id, Some(options))
            .map(|chunk| chunk.map_err(map_err))
            .boxed())
    }

    pub async fn upload(&self, container_id: &str, path: &str, tar: Bytes) -> Result<(), GatewayError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.docker()
            .await?
            .upload_to_container(container_id, Some(options), tar)
            .await
            .map_err(map_err)
    }
}
