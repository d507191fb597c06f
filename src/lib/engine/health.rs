use std::time::Duration;

use async_trait::async_trait;

/// Per-request budget of a health check.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks whether the managed application answers requests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` once the application responds at all.
    async fn responding(&self) -> bool;
}

/// Probes `GET http://localhost:{port}/`. Any HTTP response counts.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(port: u16) -> Self {
        Self::with_timeout(port, REQUEST_TIMEOUT)
    }

    /// A servlet container may accept connections long before it answers,
    /// so every request is bounded by `timeout`.
    pub fn with_timeout(port: u16, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Cannot build health check client, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            url: format!("http://localhost:{port}/"),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn responding(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Application responded");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Application not responding yet");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn silent_application_is_not_responding() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept connections and never write a byte.
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let check = HttpProbe::with_timeout(port, Duration::from_millis(200));
        let started = Instant::now();
        assert!(!check.responding().await);
        assert!(started.elapsed() < Duration::from_secs(3));

        held.abort();
    }
}
