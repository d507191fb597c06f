//! Remote SQL Server driven through the `sqlcmd` console tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::command::{CommandOutput, CommandRunner, ConsoleCommand};
use super::postgres::OnError;
use super::types::{
    BackendExtras, ConnectionDescriptor, DatabaseBackend, KEPT_DATABASE_FILES, NORMALIZED_LOGIN,
    NORMALIZED_PASSWORD_HASH, OperationTimeouts, PRINT_FORM_TABLES, REDUCE_BATCH_SIZE,
};
use crate::error::{StandError, StandResult};
use crate::retry::{Attempt, PollOutcome, RetryPolicy};

/// Column separator requested from `sqlcmd`.
const COLUMN_SEPARATOR: &str = "|";

/// Tenant marker in the database name enabling the FEFU patch.
const FEFU_TENANT: &str = "fefu";

/// Which database a statement connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Master,
    Current,
}

/// One row of `RESTORE FILELISTONLY` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub logical_name: String,
    /// `L` for log files, `D` for data files.
    pub file_type: String,
    pub file_id: String,
}

impl BackupFile {
    fn is_log(&self) -> bool {
        self.file_type.eq_ignore_ascii_case("L")
    }
}

pub struct RemoteSqlServer {
    descriptor: ConnectionDescriptor,
    files_dir: String,
    backup_path: String,
    runner: Arc<dyn CommandRunner>,
    timeouts: OperationTimeouts,
}

impl RemoteSqlServer {
    pub fn new(
        descriptor: ConnectionDescriptor,
        runner: Arc<dyn CommandRunner>,
        timeouts: OperationTimeouts,
    ) -> StandResult<Self> {
        let BackendExtras::SqlServer {
            files_dir,
            backup_dir,
        } = &descriptor.extras
        else {
            return Err(StandError::backend(
                "configure mssql",
                "descriptor is not an mssql descriptor",
            ));
        };
        let files_dir = files_dir.clone();
        let backup_path = format!("{}\\{}.bak", backup_dir, descriptor.name);

        Ok(Self {
            descriptor,
            files_dir,
            backup_path,
            runner,
            timeouts,
        })
    }

    pub fn backup_path(&self) -> &str {
        &self.backup_path
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn sqlcmd(&self, sql: &str, timeout: Duration, target: Target) -> ConsoleCommand {
        let server = format!("{},{}", self.descriptor.host, self.descriptor.effective_port());
        let mut cmd = ConsoleCommand::new("sqlcmd", timeout)
            .args(["-S", server.as_str()])
            .args(["-U", self.descriptor.user.as_str()])
            .args(["-P", self.descriptor.password.as_str()]);
        if target == Target::Current {
            cmd = cmd.args(["-d", self.name()]);
        }
        cmd.args(["-b", "-h", "-1", "-W", "-s", COLUMN_SEPARATOR])
            .args(["-t".to_string(), timeout.as_secs().to_string()])
            .args(["-Q", sql])
    }

    async fn run_sql(
        &self,
        operation: &str,
        sql: &str,
        timeout: Duration,
        target: Target,
        on_error: OnError,
    ) -> StandResult<CommandOutput> {
        tracing::debug!(server = %self.descriptor.host, timeout_secs = timeout.as_secs(), sql, "Run sql");
        let command = self.sqlcmd(sql, timeout, target);
        let output = match self.runner.run(&command).await {
            Ok(output) => output,
            Err(e) if on_error == OnError::Tolerate => {
                tracing::warn!(operation, error = %e, "Tolerated sql failure");
                return Ok(CommandOutput::default());
            }
            Err(e) => return Err(e),
        };

        if !output.success {
            tracing::debug!(operation, output = %output.summary(), "Sql failed");
            if on_error == OnError::Fail {
                return Err(StandError::backend(operation, output.summary().trim().to_string()));
            }
            tracing::warn!(operation, output = %output.summary().trim(), "Tolerated sql failure");
        }
        Ok(output)
    }

    async fn query(&self, operation: &str, sql: &str, target: Target) -> StandResult<Vec<Vec<String>>> {
        let output = self
            .run_sql(operation, sql, self.timeouts.quick, target, OnError::Fail)
            .await?;
        let rows = parse_rows(&output.stdout);
        tracing::debug!(operation, rows = rows.len(), "Query result");
        Ok(rows)
    }

    async fn backup_file_list(&self) -> StandResult<Vec<BackupFile>> {
        let sql = format!("RESTORE FILELISTONLY FROM DISK = '{}'", self.backup_path);
        let rows = self.query("read backup file list", &sql, Target::Master).await?;
        rows.into_iter()
            .map(|row| match (row.first(), row.get(2), row.get(6)) {
                (Some(logical), Some(file_type), Some(file_id)) => Ok(BackupFile {
                    logical_name: logical.clone(),
                    file_type: file_type.clone(),
                    file_id: file_id.clone(),
                }),
                _ => Err(StandError::backend(
                    "read backup file list",
                    format!("unexpected row {row:?}"),
                )),
            })
            .collect()
    }

    /// `RESTORE` statement relocating every file into `files_dir`.
    fn restore_statement(&self, files: &[BackupFile]) -> String {
        let moves = files
            .iter()
            .map(|file| {
                let extension = if file.is_log() { "LDF" } else { "MDF" };
                format!(
                    "MOVE '{}' TO '{}\\{}_{}.{}'",
                    file.logical_name,
                    self.files_dir,
                    self.name(),
                    file.file_id,
                    extension
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "RESTORE DATABASE {} FROM DISK = '{}' WITH RECOVERY, REPLACE, {};",
            self.name(),
            self.backup_path,
            moves
        )
    }

    async fn shrink_log(&self) -> StandResult<()> {
        let sql = format!("DBCC SHRINKFILE ({}_log, 1);", self.name());
        self.run_sql("shrink log", &sql, self.timeouts.middle, Target::Current, OnError::Tolerate)
            .await
            .map(|_| ())
    }

    /// Null out stored file contents in batches until a batch touches no row.
    ///
    /// The engine reclaims blob space in the background, so small batches
    /// keep each transaction cheap.
    async fn null_database_files(&self) -> u64 {
        let sql = format!(
            "SET NOCOUNT ON; UPDATE TOP({REDUCE_BATCH_SIZE}) databasefile_t SET content_p = null \
             WHERE content_p IS NOT NULL AND (filename_p NOT IN ({KEPT_DATABASE_FILES}) OR filename_p IS NULL); \
             SELECT @@ROWCOUNT;"
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
                .run_sql("null database files", &sql, self.timeouts.middle, Target::Current, OnError::Fail)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(db = %self.name(), error = %e, "Database file batch failed, skipping the rest");
                    break;
                }
            };
            batches += 1;
            match parse_row_count(&output.stdout) {
                Some(0) => break,
                Some(rows) => total += rows,
                None => {
                    tracing::warn!(db = %self.name(), output = %output.stdout.trim(), "Unexpected row count output");
                    break;
                }
            }
        }

        tracing::info!(db = %self.name(), batches, rows = total, "Database file contents removed");
        total
    }

    /// Wait until the database file table stops shrinking, so the final
    /// shrink sees all background-reclaimed space.
    async fn wait_for_space_to_settle(&self) -> StandResult<()> {
        let previous = AtomicU64::new(u64::MAX);
        let policy = RetryPolicy::new(self.timeouts.space_poll, self.timeouts.middle);
        let previous = &previous;

        let outcome = policy
            .run(move || async move {
                let rows = match self
                    .query("measure database files", "EXEC sp_spaceused 'DATABASEFILE_T';", Target::Current)
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => return Attempt::Failed(e),
                };
                let Some(size) = rows.first().and_then(|row| row.get(3)).and_then(|data| parse_kb(data)) else {
                    return Attempt::Failed(StandError::backend(
                        "measure database files",
                        format!("unexpected sp_spaceused output {rows:?}"),
                    ));
                };
                tracing::debug!(size_kb = size, "Database file table size");
                if previous.swap(size, Ordering::SeqCst) == size {
                    Attempt::Ready(size)
                } else {
                    Attempt::Pending
                }
            })
            .await;

        match outcome {
            PollOutcome::Ready(size) => {
                tracing::info!(size_kb = size, "Database file space settled");
                Ok(())
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                tracing::warn!(elapsed_secs = elapsed.as_secs(), "Database file space still changing, shrinking anyway");
                Ok(())
            }
            PollOutcome::Failed(e) => Err(e),
        }
    }
}

/// Split `sqlcmd -h -1 -W -s "|"` output into rows of trimmed cells.
fn parse_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with("rows affected)") && !line.ends_with("row affected)"))
        .map(|line| line.split(COLUMN_SEPARATOR).map(|cell| cell.trim().to_string()).collect())
        .collect()
}

/// Last numeric line of the output (`SELECT @@ROWCOUNT`).
fn parse_row_count(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

/// `"1040 KB"` to `1040`.
fn parse_kb(value: &str) -> Option<u64> {
    value.trim().trim_end_matches("KB").trim().parse().ok()
}

#[async_trait]
impl DatabaseBackend for RemoteSqlServer {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn create(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Create database");
        let name = self.name();
        let sql = format!(
            "CREATE DATABASE {name} ON (NAME = {name}_Data, FILENAME = '{dir}\\{name}.mdf') \
             LOG ON (NAME = {name}_Log, FILENAME = '{dir}\\{name}.ldf');",
            dir = self.files_dir
        );
        let quick = self.timeouts.quick;
        self.run_sql("create database", &sql, quick, Target::Master, OnError::Fail)
            .await?;
        for option in ["READ_COMMITTED_SNAPSHOT ON", "ALLOW_SNAPSHOT_ISOLATION ON"] {
            let sql = format!("ALTER DATABASE {name} SET {option};");
            self.run_sql("configure database", &sql, quick, Target::Master, OnError::Fail)
                .await?;
        }
        Ok(())
    }

    async fn drop_database(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Drop database");
        let sql = format!(
            "ALTER DATABASE {name} SET SINGLE_USER WITH ROLLBACK IMMEDIATE; DROP DATABASE {name};",
            name = self.name()
        );
        self.run_sql("drop database", &sql, self.timeouts.quick, Target::Master, OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn backup(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Backup database");
        let sql = format!(
            "BACKUP DATABASE {} TO DISK = '{}' WITH INIT",
            self.name(),
            self.backup_path
        );
        self.run_sql("backup database", &sql, self.timeouts.backup, Target::Master, OnError::Fail)
            .await
            .map(|_| ())
    }

    async fn has_default_backup(&self) -> bool {
        tracing::debug!(path = %self.backup_path, "Check default backup");
        match self.backup_file_list().await {
            Ok(files) if !files.is_empty() => true,
            Ok(_) | Err(_) => {
                tracing::info!("Default backup not found");
                false
            }
        }
    }

    async fn restore(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Restore database");
        let files = self.backup_file_list().await?;
        if files.is_empty() {
            return Err(StandError::backend("restore database", "backup contains no files"));
        }

        let sql = self.restore_statement(&files);
        self.run_sql("restore database", &sql, self.timeouts.restore, Target::Master, OnError::Fail)
            .await?;

        // Align logical names with the new database name so shrink targets resolve.
        for file in &files {
            let current = file.logical_name.to_lowercase();
            let suffix = if file.is_log() { "log" } else { file.file_id.as_str() };
            let wanted = format!("{}_{}", self.name(), suffix);
            if current != wanted {
                let sql = format!(
                    "ALTER DATABASE {} MODIFY FILE (NAME = '{}', NEWNAME = '{}')",
                    self.name(),
                    current,
                    wanted
                );
                self.run_sql("rename logical file", &sql, self.timeouts.quick, Target::Master, OnError::Fail)
                    .await?;
            }
        }
        Ok(())
    }

    async fn reduce(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Reduce database");
        let name = self.name();
        let quick = self.timeouts.quick;

        self.run_sql(
            "disable transaction log",
            &format!("ALTER DATABASE {name} SET RECOVERY SIMPLE;"),
            quick,
            Target::Master,
            OnError::Fail,
        )
        .await?;
        self.shrink_log().await?;

        // The platform recreates the constraint on its next start.
        self.run_sql(
            "truncate platform log",
            "truncate table logeventproperty_t; \
             alter table logeventproperty_t drop constraint fk_event_logeventproperty; \
             truncate table logevent_t;",
            quick,
            Target::Current,
            OnError::Fail,
        )
        .await?;
        self.run_sql("truncate nsi log", "truncate table nsientitylog_t;", quick, Target::Current, OnError::Tolerate)
            .await?;
        for table in PRINT_FORM_TABLES {
            let sql = format!("truncate table {table};");
            self.run_sql("truncate print forms", &sql, quick, Target::Current, OnError::Tolerate)
                .await?;
        }

        self.null_database_files().await;
        self.wait_for_space_to_settle().await?;

        self.shrink_log().await?;
        self.run_sql(
            "shrink database",
            &format!("DBCC SHRINKDATABASE ({name}, 5);"),
            self.timeouts.restore,
            Target::Master,
            OnError::Fail,
        )
        .await?;
        self.shrink_log().await?;

        self.run_sql(
            "enable transaction log",
            &format!("ALTER DATABASE {name} SET RECOVERY FULL;"),
            quick,
            Target::Master,
            OnError::Fail,
        )
        .await
        .map(|_| ())
    }

    async fn customer_patch(&self) -> StandResult<()> {
        if !self.name().to_lowercase().contains(FEFU_TENANT) {
            return Ok(());
        }
        tracing::info!(db = %self.name(), "Apply FEFU customer patch");
        let quick = self.timeouts.quick;
        self.run_sql(
            "customer patch",
            "truncate table FEFU_RATING_PKG_STUDENT_ROW; \
             alter table FEFU_RATING_PKG_STUDENT_ROW drop constraint fk_ratingpackage_96afe8ba; \
             truncate table FEFU_SENDING_RATING_PKG; \
             ALTER TABLE FEFU_RATING_PKG_STUDENT_ROW ADD CONSTRAINT fk_ratingpackage_96afe8ba \
             FOREIGN KEY (RATINGPACKAGE_ID) REFERENCES FEFU_SENDING_RATING_PKG(ID);",
            quick,
            Target::Current,
            OnError::Tolerate,
        )
        .await?;
        self.run_sql("customer patch", "truncate table FEFUNSILOGROW_T", quick, Target::Current, OnError::Tolerate)
            .await
            .map(|_| ())
    }

    async fn normalize_auth(&self) -> StandResult<()> {
        tracing::info!(db = %self.name(), server = %self.descriptor.host, "Set user and password 1:1");
        let sql = format!(
            "UPDATE principal_t SET LOGIN_P='{NORMALIZED_LOGIN}', passwordhash_p='{NORMALIZED_PASSWORD_HASH}', passwordsalt_p=null \
             WHERE (EXISTS (select ID from PRINCIPAL_T where LOGIN_P='{NORMALIZED_LOGIN}') and LOGIN_P='{NORMALIZED_LOGIN}') \
             OR (not EXISTS (select ID from PRINCIPAL_T where LOGIN_P='{NORMALIZED_LOGIN}') \
             and id=(select top 1 id from PRINCIPAL_T where id in (select PRINCIPAL_ID from ADMIN_T) and ACTIVE_P=1));"
        );
        self.run_sql("normalize auth", &sql, self.timeouts.quick, Target::Current, OnError::Tolerate)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlcmd_rows() {
        let out = "uni_Data|D:\\data\\uni.mdf|D|PRIMARY|1|2|1\nuni_Log|D:\\data\\uni.ldf|L||1|2|2\n\n(2 rows affected)\n";
        let rows = parse_rows(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "uni_Log");
        assert_eq!(rows[1][2], "L");
        assert_eq!(rows[1][6], "2");
    }

    #[test]
    fn parses_row_count_and_sizes() {
        assert_eq!(parse_row_count("1000\n"), Some(1000));
        assert_eq!(parse_row_count("\n0\n\n"), Some(0));
        assert_eq!(parse_row_count("Msg 208"), None);
        assert_eq!(parse_kb("1040 KB"), Some(1040));
        assert_eq!(parse_kb("oops"), None);
    }
}
