//! Workflows over the database, the application process and the build server.
//!
//! The engine runs one workflow at a time; the dispatcher in `worker`
//! serializes callers. Status and health queries may run alongside.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::System;

use super::files;
use super::health::HealthProbe;
use super::status::TaskStatusCell;
use super::types::{DatabaseSummary, EngineSettings, StatusReport, TaskKind, TaskStatus, Workflow};
use crate::backend::DatabaseBackend;
use crate::build::BuildClient;
use crate::config::StandLayout;
use crate::error::StandResult;
use crate::process::{ManagedProcess, stats};
use crate::retry::{Attempt, PollOutcome, RetryPolicy};

pub struct Engine {
    db: Arc<dyn DatabaseBackend>,
    process: Arc<dyn ManagedProcess>,
    builds: BuildClient,
    probe: Arc<dyn HealthProbe>,
    layout: StandLayout,
    settings: EngineSettings,
    status: TaskStatusCell,
    health: RetryPolicy,
    sysinfo: Mutex<System>,
}

impl Engine {
    pub fn new(
        db: Arc<dyn DatabaseBackend>,
        process: Arc<dyn ManagedProcess>,
        builds: BuildClient,
        probe: Arc<dyn HealthProbe>,
        layout: StandLayout,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            process,
            builds,
            probe,
            layout,
            settings,
            status: TaskStatusCell::default(),
            health: RetryPolicy::application_health(),
            sysinfo: Mutex::new(System::new()),
        }
    }

    pub fn with_health_policy(mut self, policy: RetryPolicy) -> Self {
        self.health = policy;
        self
    }

    pub fn task_status(&self) -> TaskStatus {
        self.status.snapshot()
    }

    pub fn layout(&self) -> &StandLayout {
        &self.layout
    }

    pub async fn status_report(&self) -> StatusReport {
        let descriptor = self.db.descriptor();
        let state = self.process.state().await;
        let application = stats::get_stats(&mut self.sysinfo.lock(), state);
        StatusReport {
            task: self.status.snapshot(),
            db: DatabaseSummary {
                db_type: descriptor.db_type().to_string(),
                addr: descriptor.host.clone(),
                port: descriptor.effective_port(),
                name: descriptor.name.clone(),
            },
            project: self.builds.project().to_string(),
            branch: self.builds.version().map(str::to_string),
            application,
        }
    }

    pub async fn start_application(&self) -> StandResult<()> {
        tracing::info!("Start application");
        self.process.start().await
    }

    pub async fn stop_application(&self) -> StandResult<()> {
        tracing::info!("Stop application");
        self.process.stop().await
    }

    async fn restart_application(&self) -> StandResult<()> {
        self.stop_application().await?;
        self.start_application().await
    }

    /// Run `workflow` to completion.
    pub async fn run(&self, workflow: Workflow) -> StandResult<()> {
        tracing::info!(workflow = %workflow, "Run workflow");
        match workflow {
            Workflow::NewStand => self.new_stand().await,
            Workflow::NewDb => self.new_db().await,
            Workflow::DropDb => self.drop_db().await,
            Workflow::Restore => self.restore().await,
            Workflow::Backup => self.backup().await,
            Workflow::Reduce => self.reduce().await,
            Workflow::Update(build) => self.update(build).await,
            Workflow::BuildAndUpdate => self.build_and_update().await,
        }
    }

    /// Run `workflow`, recording its failure in the task status instead of
    /// returning it. A success clears the previous error.
    pub async fn log_and_continue(&self, workflow: Workflow) {
        match self.run(workflow).await {
            Ok(()) => self.status.set_error(None),
            Err(e) => {
                tracing::error!(workflow = %workflow, error = %e, "Workflow failed");
                self.status.set_error(Some(e.to_string()));
            }
        }
    }

    pub async fn new_stand(&self) -> StandResult<()> {
        self.new_db().await?;
        // An empty webapp has to be fetched; an existing one only needs a restart.
        if files::is_empty_dir(&self.layout.webapp_dir).await? {
            self.update(None).await
        } else {
            self.restart_application().await
        }
    }

    pub async fn new_db(&self) -> StandResult<()> {
        self.stop_application().await?;
        {
            let _task = self.status.enter(TaskKind::CreateDb);
            self.db.create().await?;
            files::write_db_properties(&self.layout, self.db.descriptor(), self.settings.validate_entity_code)
                .await?;
        }
        // Without a backup the application creates an empty schema on first start.
        if self.db.has_default_backup().await {
            self.restore().await?;
        }
        self.start_application().await
    }

    pub async fn drop_db(&self) -> StandResult<()> {
        self.stop_application().await?;
        let _task = self.status.enter(TaskKind::DropDb);
        self.db.drop_database().await
    }

    pub async fn restore(&self) -> StandResult<()> {
        self.stop_application().await?;
        {
            let _task = self.status.enter(TaskKind::RestoreDb);
            self.db.restore().await?;
            self.db.normalize_auth().await?;
        }
        self.start_application().await
    }

    pub async fn backup(&self) -> StandResult<()> {
        self.stop_application().await?;
        {
            let _task = self.status.enter(TaskKind::BackupDb);
            self.db.backup().await?;
        }
        self.start_application().await
    }

    pub async fn reduce(&self) -> StandResult<()> {
        self.stop_application().await?;
        {
            let _task = self.status.enter(TaskKind::ReduceDb);
            self.db.reduce().await?;
            self.db.customer_patch().await?;
        }
        self.start_application().await
    }

    pub async fn update(&self, build: Option<u64>) -> StandResult<()> {
        self.stop_application().await?;
        {
            let _task = self.status.enter(TaskKind::Upload);
            let fetched = self.builds.fetch_build(&self.layout.webapp_dir, build).await?;
            let marker = files::version_marker(self.builds.project(), self.builds.version(), &fetched);
            files::write_version_marker(&self.layout, &marker).await?;
            tracing::info!(build = fetched.build_number, "Application updated");
        }
        self.start_application().await
    }

    pub async fn build_and_update(&self) -> StandResult<()> {
        let build = {
            let _task = self.status.enter(TaskKind::Build);
            self.builds.build_project().await?
        };
        self.update(Some(build)).await
    }

    /// Wait for the application to answer. Gives up early once the process
    /// is no longer running.
    pub async fn check_application(&self) -> bool {
        tracing::info!("Check application");
        let started = Instant::now();
        let outcome = self
            .health
            .run(|| async move {
                if !self.process.state().await.is_running() {
                    return Attempt::Failed(());
                }
                // A hung request must not outlive the health deadline.
                let remaining = self.health.deadline.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, self.probe.responding()).await {
                    Ok(true) => Attempt::Ready(()),
                    Ok(false) => Attempt::Pending,
                    Err(_) => {
                        tracing::debug!("Health check did not finish in time");
                        Attempt::Pending
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Ready(()) => {
                tracing::info!("Application is available");
                true
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                tracing::warn!(elapsed_secs = elapsed.as_secs(), "Application did not respond in time");
                false
            }
            PollOutcome::Failed(()) => {
                tracing::warn!("Application process is not running");
                false
            }
        }
    }

    /// Stop the application and, when configured, drop the database.
    /// Never fails.
    pub async fn shutdown(&self) {
        tracing::info!("Shutdown...");
        if let Err(e) = self.stop_application().await {
            tracing::error!(error = %e, "Failed to stop application");
        }
        if self.settings.remove_on_exit {
            if let Err(e) = self.db.drop_database().await {
                tracing::error!(error = %e, "Failed to drop database on exit");
            }
        }
    }
}
