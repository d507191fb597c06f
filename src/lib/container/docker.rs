use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    image::CreateImageOptions,
    secret::{HostConfig, PortBinding},
};
use bytes::Bytes;
use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;

use super::types::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult};

/// Port Postgres listens on inside the container.
pub const POSTGRES_CONTAINER_PORT: &str = "5432/tcp";

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_unix_defaults()?;
        Ok(DockerRuntime { client })
    }

    async fn pull(&self, image: &str) {
        tracing::info!(image, "Pulling image");

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!(image, status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally cached image still lets `create` succeed.
                    tracing::warn!(image, error = %e, "Image pull failed");
                    return;
                }
            }
        }

        tracing::info!(image, "Image pulled");
    }
}

/// Map a daemon 404 to [`RuntimeError::NotFound`].
fn not_found(container: &str) -> impl FnOnce(bollard::errors::Error) -> RuntimeError + '_ {
    move |err| match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container.to_string()),
        other => RuntimeError::Api(other),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.pull(&spec.image).await;

        let port_bindings = HashMap::from([(
            POSTGRES_CONTAINER_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
            ),
            exposed_ports: Some(HashMap::from([(
                POSTGRES_CONTAINER_PORT.to_string(),
                HashMap::new(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self.client.create_container(options, container_config).await?;
        tracing::info!(id = %response.id, host_port = spec.host_port, "Container created");
        Ok(response.id)
    }

    async fn start(&self, container: &str) -> RuntimeResult<()> {
        tracing::debug!(container, "Starting container");
        self.client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
            .map_err(not_found(container))
    }

    async fn stop(&self, container: &str, timeout: Duration) -> RuntimeResult<()> {
        tracing::info!(container, "Stopping container");
        self.client
            .stop_container(
                container,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(not_found(container))
    }

    async fn remove(&self, container: &str) -> RuntimeResult<()> {
        tracing::debug!(container, "Removing container");
        self.client
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(not_found(container))
    }

    async fn name_of(&self, container: &str) -> RuntimeResult<String> {
        let details = self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(not_found(container))?;
        let name = details.name.unwrap_or_default();
        Ok(name.trim_start_matches('/').to_string())
    }

    async fn export_archive(&self, container: &str, source: &str, dest: &Path) -> RuntimeResult<()> {
        let mut stream = self.client.download_from_container(
            container,
            Some(DownloadFromContainerOptions {
                path: source.to_string(),
            }),
        );
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(not_found(container))?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        tracing::info!(container, source, dest = %dest.display(), bytes = written, "Archive exported");
        Ok(())
    }

    async fn import_archive(&self, container: &str, dest_dir: &str, archive: &Path) -> RuntimeResult<()> {
        let tar = Bytes::from(tokio::fs::read(archive).await?);
        let size = tar.len();
        self.client
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: dest_dir.to_string(),
                    ..Default::default()
                }),
                tar,
            )
            .await
            .map_err(not_found(container))?;
        tracing::info!(container, dest_dir, bytes = size, "Archive imported");
        Ok(())
    }
}
