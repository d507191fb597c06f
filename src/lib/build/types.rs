use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Human-readable identity of a fetched build, e.g. `05.03.2024 14:20 build 118`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildDescriptor {
    pub build_number: u64,
    /// Build start time, already shifted to the stand's local offset.
    pub timestamp: String,
}

impl fmt::Display for BuildDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} build {}", self.timestamp, self.build_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    /// Path under the build's `artifact/` URL.
    pub relative_path: String,
}

/// One build as reported by the build server.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub number: u64,
    pub running: bool,
    /// `SUCCESS`, `FAILURE`, ...; `None` while running.
    pub result: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub artifacts: Vec<Artifact>,
}

impl BuildInfo {
    pub fn is_good(&self) -> bool {
        !self.running && self.result.as_deref() == Some("SUCCESS")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildServerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("build server error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The artifact transfer ended early; the partial file is on disk.
    #[error("artifact download is broken: {0}")]
    ArtifactBroken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BuildServerResult<T> = Result<T, BuildServerError>;

/// Remote CI server keyed by project name.
#[async_trait]
pub trait BuildServer: Send + Sync {
    /// Number the next triggered build will receive.
    async fn next_build_number(&self, project: &str) -> BuildServerResult<u64>;

    /// Queue a build, passing `version` as the `Version` parameter when set.
    async fn trigger(&self, project: &str, version: Option<&str>) -> BuildServerResult<()>;

    /// `None` when the build does not exist (yet). `number = None` means the latest build.
    async fn build_info(&self, project: &str, number: Option<u64>) -> BuildServerResult<Option<BuildInfo>>;

    async fn download_artifact(
        &self,
        project: &str,
        number: u64,
        artifact: &Artifact,
        dest: &Path,
    ) -> BuildServerResult<()>;
}
