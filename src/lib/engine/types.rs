use std::fmt;

use serde::{Deserialize, Serialize};

use crate::process::ProcessReport;

/// Task names recorded in the engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    CreateDb,
    RestoreDb,
    BackupDb,
    ReduceDb,
    DropDb,
    Build,
    Upload,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateDb => "CREATE_DB",
            TaskKind::RestoreDb => "RESTORE_DB",
            TaskKind::BackupDb => "BACKUP_DB",
            TaskKind::ReduceDb => "REDUCE_DB",
            TaskKind::DropDb => "DROP_DB",
            TaskKind::Build => "BUILD",
            TaskKind::Upload => "UPLOAD",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub active_task: Option<TaskKind>,
    pub last_task: Option<TaskKind>,
    pub last_error: Option<String>,
}

/// Mutating workflows the engine exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    NewStand,
    NewDb,
    DropDb,
    Restore,
    Backup,
    Reduce,
    /// Fetch a build; the latest one when `None`.
    Update(Option<u64>),
    BuildAndUpdate,
}

impl Workflow {
    pub fn name(&self) -> &'static str {
        match self {
            Workflow::NewStand => "new_stand",
            Workflow::NewDb => "new_db",
            Workflow::DropDb => "drop_db",
            Workflow::Restore => "restore",
            Workflow::Backup => "backup",
            Workflow::Reduce => "reduce",
            Workflow::Update(_) => "update",
            Workflow::BuildAndUpdate => "build_and_update",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Drop the database on shutdown.
    pub remove_on_exit: bool,
    pub validate_entity_code: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            remove_on_exit: false,
            validate_entity_code: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub db_type: String,
    pub addr: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub task: TaskStatus,
    pub db: DatabaseSummary,
    pub project: String,
    pub branch: Option<String>,
    pub application: ProcessReport,
}
