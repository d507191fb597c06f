//! Jenkins JSON API client.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::types::{Artifact, BuildInfo, BuildServer, BuildServerError, BuildServerResult};

/// Jenkins instance reached with basic auth.
pub struct JenkinsApi {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    next_build_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactResponse {
    file_name: String,
    relative_path: String,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    number: u64,
    building: bool,
    result: Option<String>,
    /// Milliseconds since the epoch.
    timestamp: i64,
    #[serde(default)]
    artifacts: Vec<ArtifactResponse>,
}

impl From<BuildResponse> for BuildInfo {
    fn from(build: BuildResponse) -> Self {
        BuildInfo {
            number: build.number,
            running: build.building,
            result: build.result,
            timestamp: DateTime::<Utc>::from_timestamp_millis(build.timestamp).unwrap_or_default(),
            artifacts: build
                .artifacts
                .into_iter()
                .map(|a| Artifact {
                    file_name: a.file_name,
                    relative_path: a.relative_path,
                })
                .collect(),
        }
    }
}

impl JenkinsApi {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password: password.into(),
        }
    }

    fn job_url(&self, project: &str) -> String {
        format!("{}/job/{}", self.url, project)
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
    }

    async fn ensure_success(response: reqwest::Response) -> BuildServerResult<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BuildServerError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BuildServer for JenkinsApi {
    async fn next_build_number(&self, project: &str) -> BuildServerResult<u64> {
        let response = self
            .get(format!("{}/api/json", self.job_url(project)))
            .send()
            .await?;
        let job: JobResponse = Self::ensure_success(response).await?.json().await?;
        Ok(job.next_build_number)
    }

    async fn trigger(&self, project: &str, version: Option<&str>) -> BuildServerResult<()> {
        let request = match version {
            Some(version) => self
                .client
                .post(format!("{}/buildWithParameters", self.job_url(project)))
                .query(&[("Version", version)]),
            None => self.client.post(format!("{}/build", self.job_url(project))),
        };
        let response = request
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn build_info(&self, project: &str, number: Option<u64>) -> BuildServerResult<Option<BuildInfo>> {
        let build = number.map_or_else(|| "lastBuild".to_string(), |n| n.to_string());
        let response = self
            .get(format!("{}/{}/api/json", self.job_url(project), build))
            .send()
            .await?;
        // Queued builds are unknown until they actually start.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let build: BuildResponse = Self::ensure_success(response).await?.json().await?;
        Ok(Some(build.into()))
    }

    async fn download_artifact(
        &self,
        project: &str,
        number: u64,
        artifact: &Artifact,
        dest: &Path,
    ) -> BuildServerResult<()> {
        let url = format!(
            "{}/{}/artifact/{}",
            self.job_url(project),
            number,
            artifact.relative_path
        );
        tracing::debug!(url = %url, dest = %dest.display(), "Download artifact");
        let response = Self::ensure_success(self.get(url).send().await?).await?;
        let expected = response.content_length();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                Err(e) => {
                    file.flush().await?;
                    return Err(BuildServerError::ArtifactBroken(format!(
                        "{} interrupted after {written} bytes: {e}",
                        artifact.file_name
                    )));
                }
            }
        }
        file.flush().await?;

        match expected {
            Some(expected) if expected != written => Err(BuildServerError::ArtifactBroken(format!(
                "{}: expected {expected} bytes, got {written}",
                artifact.file_name
            ))),
            _ => Ok(()),
        }
    }
}
