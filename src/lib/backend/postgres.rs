//! Remote Postgres driven through the `psql` / `pg_dump` / `pg_restore`
//! console tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::command::{CommandOutput, CommandRunner, ConsoleCommand};
use super::format::{self, BackupFormat};
use super::types::{
    BackendExtras, ConnectionDescriptor, DatabaseBackend, KEPT_DATABASE_FILES, NORMALIZED_LOGIN,
    NORMALIZED_PASSWORD_HASH, OperationTimeouts, PRINT_FORM_TABLES, PostgresExtras,
    REDUCE_BATCH_SIZE,
};
use crate::error::{StandError, StandResult};

/// Timeout of the liveness probe used while a server starts up.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Tenant marker in the database name enabling the PGUPS patch.
const PGUPS_TENANT: &str = "pgups";

/// Whether a failing command aborts the operation or is only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnError {
    Fail,
    Tolerate,
}

impl OnError {
    pub(crate) fn tolerate_if(flag: bool) -> Self {
        if flag { OnError::Tolerate } else { OnError::Fail }
    }
}

pub struct RemotePostgres {
    descriptor: ConnectionDescriptor,
    extras: PostgresExtras,
    backup_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeouts: OperationTimeouts,
}

impl RemotePostgres {
    /// Build from a `Postgres` or `Container` descriptor; creates the backup
    /// directory if needed.
    pub fn new(
        descriptor: ConnectionDescriptor,
        runner: Arc<dyn CommandRunner>,
        timeouts: OperationTimeouts,
    ) -> StandResult<Self> {
        let extras = match &descriptor.extras {
            BackendExtras::Postgres(extras) => extras.clone(),
            BackendExtras::Container { postgres, .. } => postgres.clone(),
            BackendExtras::SqlServer { .. } => {
                return Err(StandError::backend(
                    "configure postgres",
                    "descriptor is not a postgres descriptor",
                ));
            }
        };
        std::fs::create_dir_all(&extras.backup_dir)?;
        let backup_path = extras.backup_dir.join("default.backup");

        Ok(Self {
            descriptor,
            extras,
            backup_path,
            runner,
            timeouts,
        })
    }

    /// Use a different default backup artifact.
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = path.into();
        self
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn timeouts(&self) -> &OperationTimeouts {
        &self.timeouts
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Prefix `program` with the connection flags shared by every tool.
    fn command(&self, program: &str, timeout: Duration) -> ConsoleCommand {
        let mut cmd = ConsoleCommand::new(program, timeout)
            .args(["--host", self.descriptor.host.as_str()])
            .args(["--username", self.descriptor.user.as_str()]);
        if let Some(port) = self.descriptor.port {
            cmd = cmd.args(["--port".to_string(), port.to_string()]);
        }
        cmd.env("PGPASSWORD", self.descriptor.password.clone())
    }

    fn psql(&self, sql: &str, timeout: Duration) -> ConsoleCommand {
        self.command("psql", timeout)
            .args(["--dbname", self.name()])
            .args(["--command", sql])
    }

    /// `psql` connected to the maintenance database, for DDL on `name`.
    fn psql_server(&self, sql: &str, timeout: Duration) -> ConsoleCommand {
        self.command("psql", timeout).args(["--command", sql])
    }

    pub(crate) async fn execute(
        &self,
        operation: &str,
        command: ConsoleCommand,
        on_error: OnError,
    ) -> StandResult<CommandOutput> {
        tracing::debug!(command = %command.display(), "Run console command");
        let output = match self.runner.run(&command).await {
            Ok(output) => output,
            Err(e) if on_error == OnError::Tolerate => {
                tracing::warn!(operation, error = %e, "Tolerated console command failure");
                return Ok(CommandOutput::default());
            }
            Err(e) => return Err(e),
        };

        if !output.success {
            tracing::debug!(command = %command.display(), output = %output.summary(), "Console command failed");
            if on_error == OnError::Fail {
                return Err(StandError::backend(
                    operation,
                    format!(
                        "console command for postgresql exited with {:?}. See log for details",
                        output.code
                    ),
                ));
            }
            tracing::warn!(operation, db = %self.name(), "Tolerated console command failure");
        }
        Ok(output)
    }

    /// Cheap liveness probe against the server.
    pub async fn ping(&self) -> StandResult<()> {
        self.execute(
            "ping postgres",
            self.command("psql", PING_TIMEOUT).arg("--list"),
            OnError::Fail,
        )
        .await
        .map(|_| ())
    }

    async fn drop_if_exists(&self) -> StandResult<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", self.name());
        self.execute("drop database", self.psql_server(&sql, self.timeouts.quick), OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn restore_plain(&self) -> StandResult<()> {
        self.drop_if_exists().await?;
        self.create().await?;
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Restore plain text backup");
        let mut command = self
            .command("psql", self.timeouts.restore)
            .arg("--quiet")
            .args(["--dbname", self.name()]);
        if !self.extras.ignore_restore_errors {
            command = command.args(["--set", "ON_ERROR_STOP=1"]);
        }
        let command = command.stdin(self.backup_path.clone());
        self.execute(
            "restore plain backup",
            command,
            OnError::tolerate_if(self.extras.ignore_restore_errors),
        )
        .await
        .map(|_| ())
    }

    async fn restore_dump(&self) -> StandResult<()> {
        self.drop_if_exists().await?;
        self.create().await?;
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Restore pg_dump backup");
        let mut command = self
            .command("pg_restore", self.timeouts.restore)
            .args(["--no-owner", "--no-privileges"])
            .args(["--dbname", self.name()]);
        if !self.extras.ignore_restore_errors {
            command = command.arg("--exit-on-error");
        }
        let command = command.arg(self.backup_path.display().to_string());
        self.execute(
            "restore pg_dump backup",
            command,
            OnError::tolerate_if(self.extras.ignore_restore_errors),
        )
        .await
        .map(|_| ())
    }

    /// Null out stored file contents in batches until a batch touches no row.
    async fn null_database_files(&self) -> u64 {
        let sql = format!(
            "UPDATE databasefile_t SET content_p = NULL WHERE id IN (\
             SELECT id FROM databasefile_t WHERE content_p IS NOT NULL \
             AND (filename_p IS NULL OR filename_p NOT IN ({KEPT_DATABASE_FILES})) \
             LIMIT {REDUCE_BATCH_SIZE});"
        );
        let started = Instant::now();
        let mut total = 0u64;
        let mut batches = 0u32;

        loop {
            if started.elapsed() > self.timeouts.restore {
                tracing::error!(db = %self.name(), batches, "Timeout while removing database files. Stop operation");
                break;
            }
            let output = match self
                .execute("null database files", self.psql(&sql, self.timeouts.middle), OnError::Fail)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(db = %self.name(), error = %e, "Database file batch failed, skipping the rest");
                    break;
                }
            };
            batches += 1;
            match parse_update_count(&output.stdout) {
                Some(0) => break,
                Some(rows) => total += rows,
                None => {
                    tracing::warn!(db = %self.name(), output = %output.stdout.trim(), "Unexpected UPDATE output");
                    break;
                }
            }
        }

        tracing::info!(db = %self.name(), batches, rows = total, "Database file contents removed");
        total
    }
}

/// Row count from a psql `UPDATE <n>` command tag.
pub(crate) fn parse_update_count(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("UPDATE "))
        .and_then(|count| count.trim().parse().ok())
}

#[async_trait]
impl DatabaseBackend for RemotePostgres {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn create(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Create database");
        let sql = format!("CREATE DATABASE {}", self.name());
        self.execute("create database", self.psql_server(&sql, self.timeouts.quick), OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn drop_database(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Drop database");
        let sql = format!("DROP DATABASE {}", self.name());
        self.execute("drop database", self.psql_server(&sql, self.timeouts.quick), OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn backup(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Backup database");
        let command = self
            .command("pg_dump", self.timeouts.backup)
            .args(["--dbname", self.name()])
            .args(["--format", "c"])
            .args(["--file".to_string(), self.backup_path.display().to_string()]);
        self.execute("backup database", command, OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn has_default_backup(&self) -> bool {
        tracing::debug!(path = %self.backup_path.display(), "Check default backup");
        let present = tokio::fs::try_exists(&self.backup_path).await.unwrap_or(false);
        if !present {
            tracing::info!("Default backup not found");
        }
        present
    }

    async fn restore(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Restore database");
        match format::detect(&self.backup_path).await? {
            BackupFormat::PlainSql => self.restore_plain().await,
            BackupFormat::CustomDump | BackupFormat::TarArchive | BackupFormat::Directory => {
                self.restore_dump().await
            }
        }
    }

    async fn reduce(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Reduce database");
        let quick = self.timeouts.quick;

        self.execute("truncate platform log", self.psql("truncate logevent_t cascade;", quick), OnError::Fail)
            .await?;
        self.execute("truncate nsi log", self.psql("truncate nsientitylog_t;", quick), OnError::Tolerate)
            .await?;
        for table in PRINT_FORM_TABLES {
            let sql = format!("truncate table {table};");
            self.execute("truncate print forms", self.psql(&sql, quick), OnError::Tolerate)
                .await?;
        }

        self.null_database_files().await;

        self.execute("vacuum", self.psql("vacuum full;", self.timeouts.restore), OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn customer_patch(&self) -> StandResult<()> {
        if !self.name().contains(PGUPS_TENANT) {
            return Ok(());
        }
        tracing::info!(db = %self.name(), "Apply PGUPS customer patch");
        self.execute(
            "customer patch",
            self.psql("update app_info_s set value_p='unipgups-web'", self.timeouts.quick),
            OnError::Tolerate,
        )
        .await
        .map(|_| ())
    }

    async fn normalize_auth(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), host = %self.descriptor.host, "Set user and password 1:1");
        let sql = format!(
            "UPDATE principal_t SET login_p='{NORMALIZED_LOGIN}', passwordhash_p='{NORMALIZED_PASSWORD_HASH}', passwordsalt_p=null \
             WHERE (EXISTS (select id from principal_t where login_p='{NORMALIZED_LOGIN}') and login_p='{NORMALIZED_LOGIN}') \
             OR (NOT EXISTS (select id from principal_t where login_p='{NORMALIZED_LOGIN}') \
             and id=(select id from principal_t where id in (select principal_id from admin_t) and active_p=true limit 1));"
        );
        self.execute("normalize auth", self.psql(&sql, self.timeouts.quick), OnError::Tolerate)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_command_tag() {
        assert_eq!(parse_update_count("UPDATE 1000\n"), Some(1000));
        assert_eq!(parse_update_count("UPDATE 0"), Some(0));
        assert_eq!(parse_update_count("NOTICE: x\nUPDATE 17\n"), Some(17));
        assert_eq!(parse_update_count("ERROR"), None);
    }
}
