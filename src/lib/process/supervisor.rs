//! Supervision of the managed application (a servlet container started as
//! `catalina.sh run`) through its OS process handle.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use super::types::{ManagedProcess, ProcessState};
use crate::config::types::ApplicationConfig;
use crate::error::{StandError, StandResult};

/// Interval between liveness checks inside the settle window.
const SETTLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Slot {
    child: Option<Child>,
    /// Pid of a child taken out by `stop` and not reaped yet.
    stopping: Option<u32>,
    last_exit: Option<Option<i32>>,
}

impl Slot {
    /// Reap an exited child and report the current state.
    fn observe(&mut self) -> ProcessState {
        if let Some(pid) = self.stopping {
            return if pid_alive(pid) {
                ProcessState::Running { pid }
            } else {
                ProcessState::Exited { code: None }
            };
        }
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    if let Some(pid) = child.id() {
                        return ProcessState::Running { pid };
                    }
                }
                Ok(Some(status)) => {
                    self.last_exit = Some(status.code());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot check application process");
                    self.last_exit = Some(None);
                }
            }
            self.child = None;
        }
        match self.last_exit {
            Some(code) => ProcessState::Exited { code },
            None => ProcessState::NotStarted,
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the pid exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stop_timeout: Duration,
    settle: Duration,
    /// Serializes `start` and `stop`; `state` never waits on it.
    control: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            stop_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(500),
            control: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn from_config(config: &ApplicationConfig) -> Self {
        let mut supervisor = Self::new(&config.command, config.args.clone())
            .with_stop_timeout(Duration::from_secs(config.stop_timeout_secs))
            .with_settle(Duration::from_millis(config.start_settle_millis));
        if let Some(opts) = config.catalina_opts.as_ref().filter(|opts| !opts.is_empty()) {
            supervisor.env.push(("CATALINA_OPTS".into(), opts.clone()));
        }
        supervisor
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Wait for `child` to exit, escalating to a kill after the stop timeout.
    async fn terminate(&self, pid: u32, child: &mut Child) -> StandResult<Option<i32>> {
        // SAFETY: `pid` belongs to a child we have not reaped yet.
        let signalled = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0;
        if !signalled {
            tracing::warn!(pid, "SIGTERM failed, killing");
        }

        let graceful = if signalled {
            tokio::time::timeout(self.stop_timeout, child.wait()).await.ok()
        } else {
            None
        };
        let status = match graceful {
            Some(status) => status?,
            None => {
                tracing::warn!(pid, timeout_secs = self.stop_timeout.as_secs(), "Application did not stop, killing");
                child.kill().await?;
                child.wait().await?
            }
        };
        Ok(status.code())
    }
}

#[async_trait]
impl ManagedProcess for ProcessSupervisor {
    async fn start(&self) -> StandResult<()> {
        let _control = self.control.lock().await;
        let current = self.slot.lock().observe();
        if let ProcessState::Running { pid } = current {
            tracing::debug!(pid, "Application already running");
            return Ok(());
        }

        tracing::info!(program = %self.program, args = ?self.args, "Start application");
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StandError::Process(format!("cannot start {}: {e}", self.program)))?;
        let pid = child.id();
        {
            let mut slot = self.slot.lock();
            slot.child = Some(child);
            slot.last_exit = None;
        }

        // No readiness signal: make sure the process survives a short window
        // so an immediate stop targets a live process.
        let started = Instant::now();
        while started.elapsed() < self.settle {
            let current = self.slot.lock().observe();
            if let ProcessState::Exited { code } = current {
                return Err(StandError::Process(format!(
                    "{} exited right after start with code {code:?}",
                    self.program
                )));
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }

        tracing::info!(pid = ?pid, "Application started");
        Ok(())
    }

    async fn stop(&self) -> StandResult<()> {
        let _control = self.control.lock().await;
        let (pid, mut child) = {
            let mut slot = self.slot.lock();
            let ProcessState::Running { pid } = slot.observe() else {
                tracing::debug!("Application is not running");
                return Ok(());
            };
            let Some(child) = slot.child.take() else {
                return Ok(());
            };
            slot.stopping = Some(pid);
            (pid, child)
        };

        tracing::info!(pid, "Stop application");
        let stopped = self.terminate(pid, &mut child).await;

        let mut slot = self.slot.lock();
        slot.stopping = None;
        match stopped {
            Ok(code) => {
                tracing::info!(pid, code = ?code, "Application stopped");
                slot.last_exit = Some(code);
                Ok(())
            }
            Err(e) => {
                // Keep the handle so a later stop can retry.
                slot.child = Some(child);
                Err(e)
            }
        }
    }

    async fn state(&self) -> ProcessState {
        self.slot.lock().observe()
    }
}
