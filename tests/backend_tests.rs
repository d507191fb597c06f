mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use common::{FakeRunner, fast_timeouts, mssql_descriptor, postgres_descriptor, tar_bytes};
use stand_tools::backend::command::{CommandOutput, ConsoleCommand};
use stand_tools::backend::mssql::RemoteSqlServer;
use stand_tools::backend::postgres::RemotePostgres;
use stand_tools::backend::types::DatabaseBackend;
use stand_tools::error::StandError;

fn sql_of(command: &ConsoleCommand) -> &str {
    command
        .args
        .iter()
        .position(|a| a == "-Q" || a == "--command")
        .and_then(|i| command.args.get(i + 1))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Runner answering batch updates from `counts` in order.
fn batch_runner(counts: Vec<u64>, render: fn(u64) -> String) -> Arc<FakeRunner> {
    let counts = Mutex::new(VecDeque::from(counts));
    FakeRunner::new(move |command| {
        let sql = sql_of(command);
        if sql.contains("UPDATE TOP(1000) databasefile_t") || sql.contains("UPDATE databasefile_t") {
            let rows = counts.lock().pop_front().unwrap_or(0);
            return Ok(CommandOutput::ok(render(rows)));
        }
        if sql.contains("sp_spaceused") {
            return Ok(CommandOutput::ok("DATABASEFILE_T|2500|20480 KB|10240 KB|16 KB|24 KB\n"));
        }
        Ok(CommandOutput::ok(""))
    })
}

#[tokio::test]
async fn mssql_reduce_nulls_files_in_batches_until_empty() {
    let runner = batch_runner(vec![1000, 1000, 500, 0], |rows| format!("{rows}\n"));
    let db = RemoteSqlServer::new(mssql_descriptor(), runner.clone(), fast_timeouts()).unwrap();

    db.reduce().await.unwrap();

    let commands = runner.commands.lock().clone();
    let batches = commands
        .iter()
        .filter(|c| sql_of(c).contains("UPDATE TOP(1000) databasefile_t"))
        .count();
    assert_eq!(batches, 4);

    let statements: Vec<&str> = commands.iter().map(sql_of).collect();
    assert!(statements.first().unwrap().contains("RECOVERY SIMPLE"));
    assert!(statements.iter().any(|s| s.contains("DBCC SHRINKDATABASE (uni_fefu, 5)")));
    assert!(statements.last().unwrap().contains("RECOVERY FULL"));
    assert!(commands.iter().all(|c| c.program == "sqlcmd"));
}

#[tokio::test]
async fn mssql_optional_tables_do_not_stop_reduce() {
    let runner = FakeRunner::new(|command| {
        let sql = sql_of(command);
        if sql.contains("nsientitylog_t") || sql.contains("relation_t") {
            return Ok(CommandOutput::failed(1, "Invalid object name"));
        }
        if sql.contains("UPDATE TOP") {
            return Ok(CommandOutput::ok("0"));
        }
        if sql.contains("sp_spaceused") {
            return Ok(CommandOutput::ok("DATABASEFILE_T|0|16 KB|8 KB|8 KB|0 KB"));
        }
        Ok(CommandOutput::ok(""))
    });
    let db = RemoteSqlServer::new(mssql_descriptor(), runner, fast_timeouts()).unwrap();

    db.reduce().await.unwrap();
}

#[tokio::test]
async fn mssql_platform_log_failure_is_fatal() {
    let runner = FakeRunner::new(|command| {
        if sql_of(command).contains("truncate table logevent_t") {
            return Ok(CommandOutput::failed(1, "Cannot truncate table"));
        }
        Ok(CommandOutput::ok(""))
    });
    let db = RemoteSqlServer::new(mssql_descriptor(), runner.clone(), fast_timeouts()).unwrap();

    let err = db.reduce().await.unwrap_err();
    assert!(matches!(err, StandError::Backend { .. }));
    assert!(runner.matching("UPDATE TOP").is_empty());
}

#[tokio::test]
async fn mssql_restore_relocates_and_renames_files() {
    let runner = FakeRunner::new(|command| {
        if sql_of(command).starts_with("RESTORE FILELISTONLY") {
            return Ok(CommandOutput::ok(
                "tandem_Data|C:\\old\\tandem.mdf|D|PRIMARY|1|1|1\ntandem_Log|C:\\old\\tandem.ldf|L|NULL|1|1|2\n\n(2 rows affected)\n",
            ));
        }
        Ok(CommandOutput::ok(""))
    });
    let db = RemoteSqlServer::new(mssql_descriptor(), runner.clone(), fast_timeouts()).unwrap();

    assert!(db.has_default_backup().await);
    db.restore().await.unwrap();

    let restore = runner.matching("RESTORE DATABASE");
    assert_eq!(restore.len(), 1);
    let sql = sql_of(&restore[0]);
    assert!(sql.contains("FROM DISK = 'D:\\backup\\uni_fefu.bak'"));
    assert!(sql.contains("MOVE 'tandem_Data' TO 'D:\\data\\uni_fefu_1.MDF'"));
    assert!(sql.contains("MOVE 'tandem_Log' TO 'D:\\data\\uni_fefu_2.LDF'"));
    assert!(sql.contains("WITH RECOVERY, REPLACE"));

    let renames: Vec<String> = runner
        .matching("MODIFY FILE")
        .iter()
        .map(|c| sql_of(c).to_string())
        .collect();
    assert_eq!(renames.len(), 2);
    assert!(renames[0].contains("NEWNAME = 'uni_fefu_1'"));
    assert!(renames[1].contains("NEWNAME = 'uni_fefu_log'"));
}

#[tokio::test]
async fn mssql_missing_backup_is_reported_as_absent() {
    let runner = FakeRunner::new(|_| Ok(CommandOutput::failed(1, "Cannot open backup device")));
    let db = RemoteSqlServer::new(mssql_descriptor(), runner, fast_timeouts()).unwrap();

    assert!(!db.has_default_backup().await);
}

#[tokio::test]
async fn postgres_reduce_nulls_files_in_batches_until_empty() {
    let dir = tempfile::tempdir().unwrap();
    let runner = batch_runner(vec![1000, 1000, 500, 0], |rows| format!("UPDATE {rows}\n"));
    let db = RemotePostgres::new(postgres_descriptor(dir.path()), runner.clone(), fast_timeouts()).unwrap();

    db.reduce().await.unwrap();

    let batches = runner.matching("UPDATE databasefile_t");
    assert_eq!(batches.len(), 4);
    let last = runner.commands.lock().last().cloned().unwrap();
    assert_eq!(sql_of(&last), "vacuum full;");
}

fn restore_fixture(bytes: &[u8]) -> (tempfile::TempDir, Arc<FakeRunner>, RemotePostgres) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("default.backup"), bytes).unwrap();
    let runner = FakeRunner::succeeding();
    let db = RemotePostgres::new(postgres_descriptor(dir.path()), runner.clone(), fast_timeouts()).unwrap();
    (dir, runner, db)
}

#[tokio::test]
async fn postgres_restore_streams_plain_scripts_through_psql() {
    let (_dir, runner, db) = restore_fixture(b"--\n-- PostgreSQL database dump\n--\nCREATE TABLE t (id int);\n");

    db.restore().await.unwrap();

    let restore = runner.commands.lock().last().cloned().unwrap();
    assert_eq!(restore.program, "psql");
    assert!(restore.stdin.as_ref().unwrap().ends_with("default.backup"));
    assert!(restore.args.iter().any(|a| a == "ON_ERROR_STOP=1"));
    assert!(!runner.programs().contains(&"pg_restore".to_string()));
}

#[tokio::test]
async fn postgres_restore_hands_dumps_to_pg_restore() {
    for fixture in [b"PGDMP\x01\x0e\x00\x04\x08".to_vec(), tar_bytes()] {
        let (_dir, runner, db) = restore_fixture(&fixture);

        db.restore().await.unwrap();

        let restore = runner.commands.lock().last().cloned().unwrap();
        assert_eq!(restore.program, "pg_restore");
        assert!(restore.args.iter().any(|a| a == "--exit-on-error"));
        assert!(restore.args.last().unwrap().ends_with("default.backup"));
    }
}

#[tokio::test]
async fn postgres_restore_rejects_unknown_files() {
    let (_dir, runner, db) = restore_fixture(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00]);

    let err = db.restore().await.unwrap_err();

    assert!(matches!(err, StandError::Backend { .. }));
    assert!(runner.commands.lock().is_empty());
}

#[tokio::test]
async fn postgres_customer_patch_only_for_its_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::succeeding();
    let db = RemotePostgres::new(postgres_descriptor(dir.path()), runner.clone(), fast_timeouts()).unwrap();
    db.customer_patch().await.unwrap();
    assert!(runner.commands.lock().is_empty());

    let mut descriptor = postgres_descriptor(dir.path());
    descriptor.name = "uni_pgups".into();
    let db = RemotePostgres::new(descriptor, runner.clone(), fast_timeouts()).unwrap();
    db.customer_patch().await.unwrap();
    assert_eq!(runner.matching("unipgups-web").len(), 1);
}

#[tokio::test]
async fn postgres_commands_carry_credentials_in_the_environment() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::succeeding();
    let db = RemotePostgres::new(postgres_descriptor(dir.path()), runner.clone(), fast_timeouts()).unwrap();

    db.backup().await.unwrap();

    let command = runner.commands.lock()[0].clone();
    assert_eq!(command.program, "pg_dump");
    assert!(command.env.contains(&("PGPASSWORD".to_string(), "postgres".to_string())));
    assert!(command.args.windows(2).any(|w| w[0] == "--format" && w[1] == "c"));
}
