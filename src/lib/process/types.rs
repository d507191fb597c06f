use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StandResult;

/// Observed state of the managed application process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }

    pub fn has_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }
}

/// Resource usage of the running application, rendered by `stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Resident memory in MB.
    pub memory: u64,
    pub cpu_usage: f32,
}

/// Control over the single external application the stand serves.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// No-op when already running.
    async fn start(&self) -> StandResult<()>;

    /// No-op when not running. Graceful first, forced after a timeout.
    async fn stop(&self) -> StandResult<()>;

    /// Non-blocking probe.
    async fn state(&self) -> ProcessState;
}
