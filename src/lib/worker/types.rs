use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{Engine, Workflow};
use crate::error::StandResult;

/// Request-surface action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Mutating; goes through the queue.
    Run(Workflow),
    EngineStatus,
    /// Wait for the application to answer.
    CheckApplication,
}

impl FromStr for Action {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "new_stand" => Action::Run(Workflow::NewStand),
            "new_db" => Action::Run(Workflow::NewDb),
            "drop_db" => Action::Run(Workflow::DropDb),
            "restore" => Action::Run(Workflow::Restore),
            "backup" => Action::Run(Workflow::Backup),
            "reduce" => Action::Run(Workflow::Reduce),
            "update" => Action::Run(Workflow::Update(None)),
            "build_and_update" => Action::Run(Workflow::BuildAndUpdate),
            "engine_status" => Action::EngineStatus,
            "check_uni" => Action::CheckApplication,
            other => return Err(WorkerError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }
}

/// A queued workflow. Synchronous callers wait on `reply`.
#[derive(Debug)]
pub struct Job {
    pub id: uuid::Uuid,
    pub workflow: Workflow,
    pub reply: Option<oneshot::Sender<StandResult<()>>>,
}

/// Single-flight front of the engine: every mutating workflow runs on one
/// background loop, in arrival order.
#[derive(Clone)]
pub struct Worker {
    pub engine: Arc<Engine>,
    pub queue: mpsc::UnboundedSender<Job>,
}

pub struct StandServer {
    pub worker: Worker,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Default)]
pub struct ActionQuery {
    pub sync: Option<String>,
}

impl ActionQuery {
    /// Any non-empty value other than `0`/`false` selects synchronous dispatch.
    pub fn is_sync(&self) -> bool {
        self.sync
            .as_deref()
            .is_some_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid action {0}")]
    UnknownAction(String),

    #[error("task queue is closed")]
    QueueClosed,

    #[error("task was dropped before completion")]
    Dropped,
}

pub type WorkerResult<T> = Result<T, WorkerError>;
