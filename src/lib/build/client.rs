//! Trigger, await and fetch builds of one project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::FixedOffset;

use super::types::{BuildDescriptor, BuildInfo, BuildServer, BuildServerError};
use crate::error::{ConfigError, StandError, StandResult};
use crate::retry::{Attempt, PollOutcome, RetryPolicy};

/// Name the downloaded artifact is stored under before extraction.
pub const ARTIFACT_FILE: &str = "last_build.war";
const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M";

pub struct BuildClient {
    server: Arc<dyn BuildServer>,
    project: String,
    version: Option<String>,
    poll: RetryPolicy,
    utc_offset: FixedOffset,
}

fn server_error(operation: &str, err: BuildServerError) -> StandError {
    StandError::Build(format!("{operation}: {err}"))
}

impl BuildClient {
    pub fn new(
        server: Arc<dyn BuildServer>,
        project: impl Into<String>,
        version: Option<String>,
        utc_offset_hours: i32,
    ) -> StandResult<Self> {
        let utc_offset = FixedOffset::east_opt(utc_offset_hours * 3600).ok_or_else(|| ConfigError::Invalid {
            key: "jenkins_utc_offset_hours".into(),
            value: utc_offset_hours.to_string(),
        })?;
        Ok(Self {
            server,
            project: project.into(),
            version: version.filter(|v| !v.is_empty()),
            poll: RetryPolicy::build_status(),
            utc_offset,
        })
    }

    pub fn with_poll_policy(mut self, policy: RetryPolicy) -> Self {
        self.poll = policy;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Trigger the job and wait for it to finish. Returns the build number.
    pub async fn build_project(&self) -> StandResult<u64> {
        let project = self.project.as_str();
        // The server does not report the number of a triggered build, so take
        // it before triggering.
        let number = self
            .server
            .next_build_number(project)
            .await
            .map_err(|e| server_error("read next build number", e))?;
        tracing::info!(project, version = ?self.version, build = number, "Start build");
        self.server
            .trigger(project, self.version.as_deref())
            .await
            .map_err(|e| server_error("trigger build", e))?;

        let outcome = self
            .poll
            .run(|| async move {
                match self.server.build_info(project, Some(number)).await {
                    Ok(Some(info)) if !info.running => Attempt::Ready(info),
                    Ok(_) => {
                        tracing::debug!(build = number, "Wait build");
                        Attempt::Pending
                    }
                    Err(e) => Attempt::Failed(e),
                }
            })
            .await;

        let info = match outcome {
            PollOutcome::Ready(info) => Some(info),
            PollOutcome::TimedOut { elapsed, .. } => {
                tracing::warn!(build = number, elapsed_secs = elapsed.as_secs(), "Build still running, checking its status anyway");
                self.server
                    .build_info(project, Some(number))
                    .await
                    .map_err(|e| server_error("read build status", e))?
            }
            PollOutcome::Failed(e) => return Err(server_error("read build status", e)),
        };

        match info {
            Some(info) if info.is_good() => {
                tracing::info!(project, build = number, "Build finished");
                Ok(number)
            }
            _ => Err(StandError::Build("Last build is incorrect".into())),
        }
    }

    /// Download and unpack a successful build into `target_dir`, replacing
    /// its contents. `number = None` fetches the latest build.
    pub async fn fetch_build(&self, target_dir: &Path, number: Option<u64>) -> StandResult<BuildDescriptor> {
        tracing::info!(project = %self.project, dir = %target_dir.display(), build = ?number, "Get build");
        let info = self
            .server
            .build_info(&self.project, number)
            .await
            .map_err(|e| server_error("read build", e))?
            .ok_or_else(|| StandError::Build(format!("build {number:?} of project {} not found", self.project)))?;
        tracing::debug!(build = info.number, result = ?info.result, "Build status");

        if !info.is_good() {
            return Err(StandError::Build(format!(
                "Last build of project {} is not SUCCESS",
                self.project
            )));
        }

        clear_dir(target_dir).await?;

        let artifact = info
            .artifacts
            .first()
            .ok_or_else(|| StandError::Build(format!("build {} has no artifacts", info.number)))?;
        let war_file = target_dir.join(ARTIFACT_FILE);
        tracing::debug!(artifact = %artifact.file_name, dest = %war_file.display(), "Download build artifact");

        match self
            .server
            .download_artifact(&self.project, info.number, artifact, &war_file)
            .await
        {
            Ok(()) => {}
            // Length mismatches are common behind the proxy; the archive check decides.
            Err(BuildServerError::ArtifactBroken(reason)) => {
                tracing::warn!(reason, "Artifact reported as broken");
            }
            Err(e) => return Err(server_error("download artifact", e)),
        }

        unpack(war_file, target_dir.to_path_buf()).await?;

        Ok(self.describe(&info))
    }

    fn describe(&self, info: &BuildInfo) -> BuildDescriptor {
        BuildDescriptor {
            build_number: info.number,
            timestamp: info
                .timestamp
                .with_timezone(&self.utc_offset)
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        }
    }
}

async fn clear_dir(dir: &Path) -> StandResult<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Validate the archive and extract it next to itself.
async fn unpack(archive: PathBuf, into: PathBuf) -> StandResult<()> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|_| StandError::Build("Cannot unpack build artifact. It is not zip file".into()))?;
        tracing::debug!(entries = zip.len(), "Unpack war");
        zip.extract(&into)
            .map_err(|e| StandError::Build(format!("Cannot unpack build artifact: {e}")))
    })
    .await
    .map_err(|e| StandError::Build(format!("unpack task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::types::{Artifact, BuildServerResult};
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn unpack_rejects_non_zip_files() {
        let dir = tempfile::tempdir().unwrap();
        let war = dir.path().join(ARTIFACT_FILE);
        std::fs::write(&war, b"<html>502 Bad Gateway</html>").unwrap();

        let err = unpack(war, dir.path().to_path_buf()).await.unwrap_err();
        assert!(matches!(err, StandError::Build(msg) if msg.contains("not zip")));
    }

    #[test]
    fn descriptor_uses_the_configured_offset() {
        struct NoServer;
        #[async_trait::async_trait]
        impl BuildServer for NoServer {
            async fn next_build_number(&self, _: &str) -> BuildServerResult<u64> {
                Ok(1)
            }
            async fn trigger(&self, _: &str, _: Option<&str>) -> BuildServerResult<()> {
                Ok(())
            }
            async fn build_info(
                &self,
                _: &str,
                _: Option<u64>,
            ) -> BuildServerResult<Option<BuildInfo>> {
                Ok(None)
            }
            async fn download_artifact(
                &self,
                _: &str,
                _: u64,
                _: &Artifact,
                _: &Path,
            ) -> BuildServerResult<()> {
                Ok(())
            }
        }

        let client = BuildClient::new(Arc::new(NoServer), "product_uni", None, 5).unwrap();
        let info = BuildInfo {
            number: 118,
            running: false,
            result: Some("SUCCESS".into()),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 9, 20, 0).unwrap(),
            artifacts: vec![],
        };
        assert_eq!(client.describe(&info).to_string(), "05.03.2024 14:20 build 118");
    }
}
