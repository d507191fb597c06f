//! Console tool invocation (`psql`, `pg_dump`, `pg_restore`, `sqlcmd`).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{StandError, StandResult};

/// Characters of failing command output kept in the log.
const LOGGED_OUTPUT_LIMIT: usize = 1000;

/// One console tool invocation.
#[derive(Debug, Clone)]
pub struct ConsoleCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// File streamed to the tool's stdin.
    pub stdin: Option<PathBuf>,
    pub timeout: Duration,
}

impl ConsoleCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Command line for logs, with the value after any password flag masked.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("****".into());
                mask_next = false;
            } else {
                mask_next = arg == "-P";
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Combined output, trimmed to the last [`LOGGED_OUTPUT_LIMIT`] characters.
    pub fn summary(&self) -> String {
        let text = format!("{}{}", self.stdout, self.stderr);
        let total = text.chars().count();
        if total <= LOGGED_OUTPUT_LIMIT {
            return text;
        }
        let tail: String = text.chars().skip(total - LOGGED_OUTPUT_LIMIT).collect();
        format!("{tail} \n and another {} symbols", total - LOGGED_OUTPUT_LIMIT)
    }
}

/// Executes console commands against a database engine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported in the output, not as
    /// an error; spawn failures and timeouts are errors.
    async fn run(&self, command: &ConsoleCommand) -> StandResult<CommandOutput>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ConsoleCommand) -> StandResult<CommandOutput> {
        let started = Instant::now();
        let stdin = match &command.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path).map_err(|e| {
                StandError::backend(command.program.clone(), format!("cannot open {}: {e}", path.display()))
            })?),
            None => Stdio::null(),
        };

        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StandError::backend(command.program.clone(), e))?;

        let output = tokio::time::timeout(command.timeout, child.wait_with_output())
            .await
            .map_err(|_| StandError::timeout(command.display(), started.elapsed()))?
            .map_err(|e| StandError::backend(command.program.clone(), e))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_passwords() {
        let cmd = ConsoleCommand::new("sqlcmd", Duration::from_secs(1))
            .args(["-U", "sa", "-P", "hunter2", "-Q", "select 1"]);
        assert_eq!(cmd.display(), "sqlcmd -U sa -P **** -Q select 1");
    }

    #[test]
    fn summary_keeps_the_tail_of_long_output() {
        let output = CommandOutput {
            stdout: "a".repeat(1500),
            stderr: "END".into(),
            ..Default::default()
        };
        let summary = output.summary();
        assert!(summary.contains("END"));
        assert!(summary.ends_with("and another 503 symbols"));
    }

    #[tokio::test]
    async fn system_runner_reports_exit_status() {
        let ok = SystemRunner
            .run(&ConsoleCommand::new("sh", Duration::from_secs(5)).args(["-c", "echo hi"]))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hi");

        let failed = SystemRunner
            .run(&ConsoleCommand::new("sh", Duration::from_secs(5)).args(["-c", "exit 3"]))
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.code, Some(3));
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let err = SystemRunner
            .run(&ConsoleCommand::new("sleep", Duration::from_millis(50)).arg("5"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
