//! Postgres running in a container owned by the stand.
//!
//! Wraps a [`RemotePostgres`] pointed at the container's published port and
//! adds the container lifecycle: creation on `create`, removal on `drop`,
//! and data-directory snapshots for `backup`/`restore`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use super::identity::IdentityFile;
use super::state::valid_state_transition;
use super::types::{ContainerIdentity, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError};
use crate::backend::command::CommandRunner;
use crate::backend::format::{self, BackupFormat};
use crate::backend::postgres::RemotePostgres;
use crate::backend::types::{BackendExtras, ConnectionDescriptor, DatabaseBackend, OperationTimeouts};
use crate::error::{StandError, StandResult};
use crate::retry::{Attempt, PollOutcome, RetryPolicy};

/// Server data directory inside the container.
pub const DATA_DIR: &str = "/var/lib/postgresql/data";
/// Snapshot artifact name inside the backup directory.
pub const SNAPSHOT_FILE: &str = "default.tar";
/// Grace period for a clean server shutdown before a snapshot.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
/// Host ports picked for a brand new container.
const PORT_RANGE: std::ops::Range<u16> = 40000..50000;

pub struct ContainerizedPostgres {
    delegate: RemotePostgres,
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    /// Configured fixed name; `None` lets the runtime generate one.
    fixed_name: Option<String>,
    identity_file: IdentityFile,
    identity: Mutex<ContainerIdentity>,
    state: Mutex<ContainerState>,
    startup: RetryPolicy,
}

impl ContainerizedPostgres {
    /// Resolve the container identity and try to bring an existing
    /// container up. A missing container is not an error: `create` makes one.
    pub async fn attach(
        descriptor: ConnectionDescriptor,
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
        timeouts: OperationTimeouts,
    ) -> StandResult<Self> {
        let supervisor = Self::new(descriptor, runner, runtime, timeouts)?;
        supervisor.resume().await;
        Ok(supervisor)
    }

    /// Build without touching the runtime.
    pub fn new(
        mut descriptor: ConnectionDescriptor,
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
        timeouts: OperationTimeouts,
    ) -> StandResult<Self> {
        let BackendExtras::Container {
            postgres,
            image,
            container,
        } = &descriptor.extras
        else {
            return Err(StandError::backend(
                "configure pgdocker",
                "descriptor is not a container descriptor",
            ));
        };
        let image = image.clone();
        let fixed_name = container.clone();
        let backup_dir = postgres.backup_dir.clone();
        std::fs::create_dir_all(&backup_dir)?;

        let identity_file = IdentityFile::in_dir(&backup_dir);
        let stored = identity_file.load().unwrap_or_else(|| {
            tracing::info!("No database container recorded");
            ContainerIdentity {
                name: String::new(),
                port: rand::thread_rng().gen_range(PORT_RANGE),
            }
        });
        let identity = ContainerIdentity {
            name: fixed_name.clone().unwrap_or(stored.name),
            port: descriptor.port.unwrap_or(stored.port),
        };
        descriptor.port = Some(identity.port);

        let delegate = RemotePostgres::new(descriptor, runner, timeouts)?
            .with_backup_path(backup_dir.join(SNAPSHOT_FILE));

        Ok(Self {
            delegate,
            runtime,
            image,
            fixed_name,
            identity_file,
            identity: Mutex::new(identity),
            state: Mutex::new(ContainerState::Unknown),
            startup: RetryPolicy::container_startup(),
        })
    }

    /// Override the startup probe budget.
    pub fn with_startup_policy(mut self, policy: RetryPolicy) -> Self {
        self.startup = policy;
        self
    }

    pub fn identity(&self) -> ContainerIdentity {
        self.identity.lock().clone()
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    pub fn backup_path(&self) -> &std::path::Path {
        self.delegate.backup_path()
    }

    fn transition(&self, dst: ContainerState) {
        let mut state = self.state.lock();
        if !valid_state_transition(&state, &dst) {
            tracing::warn!(from = ?*state, to = ?dst, "Unexpected container state transition");
        }
        *state = dst;
    }

    async fn resume(&self) {
        let name = self.identity.lock().name.clone();
        if name.is_empty() {
            tracing::warn!("Database container not found, you can try create new");
            self.transition(ContainerState::Missing);
            return;
        }
        tracing::debug!(container = %name, "Try start db container");
        self.transition(ContainerState::Starting);
        match self.runtime.start(&name).await {
            Ok(()) => {
                if let Err(e) = self.wait_ready(&name).await {
                    tracing::warn!(container = %name, error = %e, "Database container did not start");
                }
            }
            Err(RuntimeError::NotFound(_)) => {
                tracing::warn!(container = %name, "Database container not found, you can try create new");
                self.transition(ContainerState::Missing);
            }
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Database container did not start");
                self.transition(ContainerState::Stopped);
            }
        }
    }

    /// Start `container` and probe the server until it answers.
    async fn start_and_wait(&self, container: &str) -> StandResult<()> {
        let previous = self.state();
        self.transition(ContainerState::Starting);
        tracing::debug!(container, "Try start db container");

        if let Err(e) = self.runtime.start(container).await {
            *self.state.lock() = previous;
            return Err(runtime_error("start container", e));
        }
        self.wait_ready(container).await
    }

    async fn wait_ready(&self, container: &str) -> StandResult<()> {
        let started = Instant::now();
        let outcome = self
            .startup
            .run(|| async {
                // The server refuses connections while it initializes its files.
                match self.delegate.ping().await {
                    Ok(()) => Attempt::Ready(()),
                    Err(e) => {
                        tracing::debug!(error = %e, "Database is not ready yet");
                        Attempt::<(), StandError>::Pending
                    }
                }
            })
            .await;

        match outcome {
            PollOutcome::Ready(()) => {
                self.transition(ContainerState::Running);
                tracing::info!(container, elapsed_ms = started.elapsed().as_millis() as u64, "Database container is up");
                Ok(())
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                self.transition(ContainerState::Stopped);
                Err(StandError::timeout("pgdocker start", elapsed))
            }
            PollOutcome::Failed(e) => {
                self.transition(ContainerState::Stopped);
                Err(e)
            }
        }
    }

    async fn create_container(&self) -> StandResult<String> {
        let mut env = HashMap::new();
        env.insert(
            "POSTGRES_PASSWORD".to_string(),
            self.delegate.descriptor().password.clone(),
        );
        let spec = ContainerSpec {
            name: self.fixed_name.clone(),
            image: self.image.clone(),
            host_port: self.identity.lock().port,
            env,
        };
        tracing::debug!(name = ?spec.name, port = spec.host_port, "Create container");
        self.runtime
            .create(&spec)
            .await
            .map_err(|e| runtime_error("create container", e))
    }

    async fn remove_container(&self, container: &str) -> StandResult<()> {
        self.runtime
            .remove(container)
            .await
            .map_err(|e| runtime_error("remove container", e))?;
        self.transition(ContainerState::Missing);
        Ok(())
    }

    /// Record the runtime's name for `container`, or forget it when `None`.
    async fn save_container(&self, container: Option<&str>) -> StandResult<()> {
        let name = match container {
            Some(id) => self
                .runtime
                .name_of(id)
                .await
                .map_err(|e| runtime_error("inspect container", e))?,
            None => String::new(),
        };
        let identity = {
            let mut identity = self.identity.lock();
            identity.name = name;
            identity.clone()
        };
        self.identity_file.save(&identity)
    }

    /// Force-remove a container that failed to come up, keeping the original error.
    async fn discard(&self, container: &str, cause: StandError) -> StandError {
        if let Err(e) = self.runtime.remove(container).await {
            tracing::warn!(container, error = %e, "Failed to remove broken container");
        }
        self.transition(ContainerState::Missing);
        cause
    }

    async fn restore_snapshot(&self) -> StandResult<()> {
        tracing::info!(
            container = %self.identity.lock().name,
            host = %self.delegate.descriptor().host,
            "Restore filesystem backup"
        );
        // Old data files must go: the volume is removed with the container.
        let current = self.identity.lock().name.clone();
        if !current.is_empty() {
            self.remove_container(&current).await?;
            self.save_container(None).await?;
        }

        let container = self.create_container().await?;
        let restored = async {
            self.runtime
                .import_archive(&container, DATA_DIR, self.delegate.backup_path())
                .await
                .map_err(|e| runtime_error("import snapshot", e))?;
            self.start_and_wait(&container).await?;
            self.save_container(Some(&container)).await
        }
        .await;

        match restored {
            Ok(()) => Ok(()),
            Err(e) => Err(self.discard(&container, e).await),
        }
    }
}

fn runtime_error(operation: &str, err: RuntimeError) -> StandError {
    StandError::backend(operation, err)
}

#[async_trait]
impl DatabaseBackend for ContainerizedPostgres {
    fn descriptor(&self) -> &ConnectionDescriptor {
        self.delegate.descriptor()
    }

    async fn create(&self) -> StandResult<()> {
        let identity = self.identity();
        tracing::info!(name = %identity.name, port = identity.port, "Create container with postgres db");

        let container = self.create_container().await?;
        let created = async {
            self.start_and_wait(&container).await?;
            self.delegate.create().await?;
            // Identity only changes after a successful start.
            self.save_container(Some(&container)).await
        }
        .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) => Err(self.discard(&container, e).await),
        }
    }

    async fn drop_database(&self) -> StandResult<()> {
        let name = self.identity.lock().name.clone();
        tracing::info!(container = %name, "Drop pgdocker container");
        if name.is_empty() {
            return Err(StandError::backend("drop database", "no database container"));
        }
        self.remove_container(&name).await?;
        self.save_container(None).await
    }

    async fn backup(&self) -> StandResult<()> {
        let name = self.identity.lock().name.clone();
        tracing::info!(container = %name, host = %self.delegate.descriptor().host, "Backup database container");

        // Data files are only consistent while the server is down.
        self.runtime
            .stop(&name, STOP_TIMEOUT)
            .await
            .map_err(|e| runtime_error("stop container", e))?;
        self.transition(ContainerState::Stopped);

        let source = format!("{DATA_DIR}/.");
        let exported = self
            .runtime
            .export_archive(&name, &source, self.delegate.backup_path())
            .await
            .map_err(|e| runtime_error("export snapshot", e));

        let restarted = self.start_and_wait(&name).await;
        match (exported, restarted) {
            (Ok(()), restarted) => restarted,
            (Err(export), Ok(())) => Err(export),
            (Err(export), Err(restart)) => {
                tracing::error!(container = %name, error = %restart, "Database container did not restart after backup");
                Err(StandError::backend(
                    "backup database",
                    format!("{export}; restart failed: {restart}"),
                ))
            }
        }
    }

    async fn has_default_backup(&self) -> bool {
        self.delegate.has_default_backup().await
    }

    async fn restore(&self) -> StandResult<()> {
        match format::detect(self.delegate.backup_path()).await? {
            BackupFormat::TarArchive => self.restore_snapshot().await,
            _ => self.delegate.restore().await,
        }
    }

    async fn reduce(&self) -> StandResult<()> {
        self.delegate.reduce().await
    }

    async fn customer_patch(&self) -> StandResult<()> {
        self.delegate.customer_patch().await
    }

    async fn normalize_auth(&self) -> StandResult<()> {
        self.delegate.normalize_auth().await
    }
}
