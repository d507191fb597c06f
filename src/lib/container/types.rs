use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of the database container as seen by the stand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    Unknown,
    Missing,
    Stopped,
    Starting,
    Running,
}

/// Container name and published host port, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    /// Empty when no container exists.
    pub name: String,
    pub port: u16,
}

/// What to create. The container listens on 5432 inside and is published
/// on `host_port`.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Generated by the runtime when `None`.
    pub name: Option<String>,
    pub image: String,
    pub host_port: u16,
    pub env: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Container engine operations the database supervisor needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (without starting) and return the container id.
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start(&self, container: &str) -> RuntimeResult<()>;

    /// Graceful stop; returns once the container is no longer running.
    async fn stop(&self, container: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Force removal together with its volumes.
    async fn remove(&self, container: &str) -> RuntimeResult<()>;

    /// Resolve an id to the container's name.
    async fn name_of(&self, container: &str) -> RuntimeResult<String>;

    /// Write a tar archive of `source` inside the container to `dest`.
    async fn export_archive(&self, container: &str, source: &str, dest: &Path) -> RuntimeResult<()>;

    /// Extract the tar archive at `archive` into `dest_dir` inside the container.
    async fn import_archive(&self, container: &str, dest_dir: &str, archive: &Path) -> RuntimeResult<()>;
}
