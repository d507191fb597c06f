//! Bounded polling shared by container startup, build-status polling and
//! application health checks.
//!
//! A [`RetryPolicy`] repeatedly invokes an attempt closure, sleeping a
//! fixed interval between attempts, until the attempt reports a terminal
//! result or the policy's budget (deadline and/or attempt count) runs out.

use std::future::Future;
use std::time::{Duration, Instant};

/// Result of a single polling attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The awaited condition holds; stop polling.
    Ready(T),
    /// Not there yet; try again after the interval.
    Pending,
    /// A hard failure; stop polling immediately.
    Failed(E),
}

/// Terminal classification of a polling run.
#[derive(Debug)]
pub enum PollOutcome<T, E> {
    Ready(T),
    TimedOut { attempts: u32, elapsed: Duration },
    Failed(E),
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay between consecutive attempts.
    pub interval: Duration,
    /// Total wall-clock budget measured from the first attempt.
    pub deadline: Duration,
    /// Optional cap on the number of attempts.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            max_attempts: None,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Database container startup: 15 probes, 2 seconds apart.
    pub const fn container_startup() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30)).with_max_attempts(15)
    }

    /// Remote build completion: every 15 seconds for up to 10 minutes.
    pub const fn build_status() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(600))
    }

    /// Managed application availability: every 5 seconds for up to 15 minutes
    /// (schema migrations on first start can be slow).
    pub const fn application_health() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(900))
    }

    /// Run `attempt` until it reports a terminal result or the budget is spent.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> PollOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match attempt().await {
                Attempt::Ready(value) => return PollOutcome::Ready(value),
                Attempt::Failed(err) => return PollOutcome::Failed(err),
                Attempt::Pending => {}
            }

            let attempts_spent = self.max_attempts.is_some_and(|max| attempts >= max);
            let elapsed = started.elapsed();
            if attempts_spent || elapsed + self.interval > self.deadline {
                tracing::debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "Retry budget exhausted");
                return PollOutcome::TimedOut { attempts, elapsed };
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
