use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database backend flavour driving the stand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// Remote SQL Server reached over `sqlcmd`.
    Mssql,
    /// Remote Postgres reached over the `psql` tool family.
    Postgres,
    /// Postgres in a container owned by the stand.
    #[default]
    Pgdocker,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Mssql => "mssql",
            DbType::Postgres => "postgres",
            DbType::Pgdocker => "pgdocker",
        }
    }

    /// Port the engine listens on when none is configured.
    pub fn default_port(&self) -> u16 {
        match self {
            DbType::Mssql => 1433,
            DbType::Postgres | DbType::Pgdocker => 5432,
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" => Ok(DbType::Mssql),
            "postgres" => Ok(DbType::Postgres),
            "pgdocker" => Ok(DbType::Pgdocker),
            other => Err(format!("unsupported db_type {other}")),
        }
    }
}

/// Root configuration of the stand.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StandConfig {
    pub log_level: String,
    /// `json` or anything else for human-readable output.
    pub log_format: String,
    pub db_type: DbType,
    /// Address the action server binds to.
    pub engine_host: String,
    pub engine_port: u16,
    /// Root of all state the stand keeps on disk.
    pub work_dir: PathBuf,
    /// Seed copied into `<work_dir>/config` on first start.
    pub template_config_dir: Option<PathBuf>,
    pub application: ApplicationConfig,
    pub db: DbConfig,
    pub jenkins: JenkinsConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for StandConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "pretty".into(),
            db_type: DbType::default(),
            engine_host: "0.0.0.0".into(),
            engine_port: 8082,
            work_dir: PathBuf::from("/usr/local/test_tools_data"),
            template_config_dir: None,
            application: ApplicationConfig::default(),
            db: DbConfig::default(),
            jenkins: JenkinsConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// The managed application (a servlet container running the product build).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub command: String,
    pub args: Vec<String>,
    /// HTTP port probed by the health check.
    pub port: u16,
    /// Exported to the child as `CATALINA_OPTS` when set.
    pub catalina_opts: Option<String>,
    pub stop_timeout_secs: u64,
    pub start_settle_millis: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            command: "catalina.sh".into(),
            args: vec!["run".into()],
            port: 8080,
            catalina_opts: None,
            stop_timeout_secs: 30,
            start_settle_millis: 500,
        }
    }
}

/// Database section. Unset values fall back to per-backend defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub backup_dir: Option<PathBuf>,
    /// `false` for databases carrying customer-specific entities.
    pub validate_entity_code: bool,
    /// Drop the database when the stand shuts down.
    pub rm: bool,
    /// Directory on the SQL Server host holding data and log files.
    pub mssql_db_dir: Option<String>,
    pub postgres_ignore_restore_errors: Option<bool>,
    /// Fixed database container name; generated when absent.
    pub container: Option<String>,
    pub pgdocker_image: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            ip: None,
            port: None,
            name: None,
            user: None,
            password: None,
            backup_dir: None,
            validate_entity_code: true,
            rm: false,
            mssql_db_dir: None,
            postgres_ignore_restore_errors: None,
            container: None,
            pgdocker_image: None,
        }
    }
}

/// Build server section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JenkinsConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub project: String,
    /// Passed as the `Version` build parameter when set.
    pub branch: Option<String>,
    /// Offset applied to build timestamps in the version marker.
    pub utc_offset_hours: i32,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            project: "product_uni".into(),
            branch: None,
            utc_offset_hours: 5,
        }
    }
}

/// Per-operation-class timeouts, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub quick_secs: u64,
    pub middle_secs: u64,
    pub backup_secs: u64,
    pub restore_secs: u64,
    pub space_poll_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_secs: 120,
            middle_secs: 1200,
            backup_secs: 3600,
            restore_secs: 10800,
            space_poll_secs: 60,
        }
    }
}

/// On-disk layout under the work directory.
#[derive(Debug, Clone)]
pub struct StandLayout {
    pub work_dir: PathBuf,
    pub config_dir: PathBuf,
    pub template_config_dir: Option<PathBuf>,
    pub version_file: PathBuf,
    pub db_properties_file: PathBuf,
    pub webapp_dir: PathBuf,
}

impl StandLayout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let config_dir = work_dir.join("config");
        Self {
            version_file: config_dir.join("version.txt"),
            db_properties_file: config_dir.join("hibernate.properties"),
            webapp_dir: work_dir.join("webapp"),
            template_config_dir: None,
            config_dir,
            work_dir,
        }
    }

    pub fn with_template_config_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.template_config_dir = dir;
        self
    }

    pub fn default_backup_dir(&self) -> PathBuf {
        self.work_dir.join("backup")
    }
}
