use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::types::{DbType, TimeoutConfig};
use crate::error::StandResult;

/// Where and how to reach one database.
///
/// Built once at startup from configuration. Only the container
/// supervisor adjusts `port` (from its persisted identity) before handing
/// the descriptor to its Postgres delegate.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub host: String,
    /// `None` means "backend default".
    pub port: Option<u16>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub extras: BackendExtras,
}

impl ConnectionDescriptor {
    pub fn db_type(&self) -> DbType {
        match self.extras {
            BackendExtras::SqlServer { .. } => DbType::Mssql,
            BackendExtras::Postgres(_) => DbType::Postgres,
            BackendExtras::Container { .. } => DbType::Pgdocker,
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.db_type().default_port())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresExtras {
    pub backup_dir: PathBuf,
    /// Keep restoring past per-statement errors.
    pub ignore_restore_errors: bool,
}

#[derive(Debug, Clone)]
pub enum BackendExtras {
    SqlServer {
        /// Server-side directory for data and log files.
        files_dir: String,
        /// Server-side directory for `.bak` files.
        backup_dir: String,
    },
    Postgres(PostgresExtras),
    Container {
        postgres: PostgresExtras,
        image: String,
        container: Option<String>,
    },
}

/// Timeout classes for remote operations.
#[derive(Debug, Clone, Copy)]
pub struct OperationTimeouts {
    pub quick: Duration,
    pub middle: Duration,
    pub backup: Duration,
    pub restore: Duration,
    /// Pause between space-usage samples while reclamation settles.
    pub space_poll: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        TimeoutConfig::default().into()
    }
}

impl From<TimeoutConfig> for OperationTimeouts {
    fn from(config: TimeoutConfig) -> Self {
        Self {
            quick: Duration::from_secs(config.quick_secs),
            middle: Duration::from_secs(config.middle_secs),
            backup: Duration::from_secs(config.backup_secs),
            restore: Duration::from_secs(config.restore_secs),
            space_poll: Duration::from_secs(config.space_poll_secs),
        }
    }
}

/// Rows per blob-nulling batch during `reduce`.
pub const REDUCE_BATCH_SIZE: u64 = 1000;

/// Files the platform still needs after blob nulling.
pub const KEPT_DATABASE_FILES: &str = "'platform-variables.less', 'platform.css', 'shared.css'";

/// Well-known login forced by `normalize_auth` (password `1`).
pub const NORMALIZED_LOGIN: &str = "1";
pub const NORMALIZED_PASSWORD_HASH: &str = "c4ca4238a0b923820dcc509a6f75849b";

/// Optional tables holding rendered document print forms.
pub const PRINT_FORM_TABLES: [&str; 7] = [
    "studentextracttextrelation_t",
    "studentordertextrelation_t",
    "stdntothrordrtxtrltn_t",
    "employeeordertextrelation_t",
    "employeeextracttextrelation_t",
    "session_doc_printform_t",
    "session_att_bull_printform_t",
];

/// Lifecycle operations every database backend provides.
///
/// All inputs are fixed by the [`ConnectionDescriptor`] the backend was
/// built from.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    fn descriptor(&self) -> &ConnectionDescriptor;

    /// Provision an empty database. Fails if it already exists.
    async fn create(&self) -> StandResult<()>;

    /// Remove the database. Not idempotent.
    async fn drop_database(&self) -> StandResult<()>;

    /// Write the default backup artifact.
    async fn backup(&self) -> StandResult<()>;

    /// Whether a usable default backup is present. Never fails.
    async fn has_default_backup(&self) -> bool;

    /// Replace the database contents with the default backup.
    async fn restore(&self) -> StandResult<()>;

    /// Destructive space reclamation; safe to re-run after a partial failure.
    async fn reduce(&self) -> StandResult<()>;

    /// Tenant-specific data fixups; no-op for unknown tenants.
    async fn customer_patch(&self) -> StandResult<()>;

    /// Best-effort: make login `1` / password `1` usable.
    async fn normalize_auth(&self) -> StandResult<()>;
}
