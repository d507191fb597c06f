#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use stand_tools::backend::command::{CommandOutput, CommandRunner, ConsoleCommand};
use stand_tools::backend::types::{
    BackendExtras, ConnectionDescriptor, DatabaseBackend, OperationTimeouts, PostgresExtras,
};
use stand_tools::build::types::{Artifact, BuildInfo, BuildServer, BuildServerResult};
use stand_tools::build::BuildClient;
use stand_tools::config::StandLayout;
use stand_tools::container::types::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeResult};
use stand_tools::engine::{Engine, EngineSettings, HealthProbe};
use stand_tools::error::{StandError, StandResult};
use stand_tools::process::{ManagedProcess, ProcessState};
use stand_tools::retry::RetryPolicy;

pub fn fast_timeouts() -> OperationTimeouts {
    OperationTimeouts {
        quick: Duration::from_secs(5),
        middle: Duration::from_secs(5),
        backup: Duration::from_secs(5),
        restore: Duration::from_secs(30),
        space_poll: Duration::from_millis(1),
    }
}

pub fn fast_poll() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_secs(5))
}

pub fn postgres_descriptor(backup_dir: &Path) -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: "10.0.0.5".into(),
        port: Some(5432),
        name: "uni".into(),
        user: "postgres".into(),
        password: "postgres".into(),
        extras: BackendExtras::Postgres(PostgresExtras {
            backup_dir: backup_dir.to_path_buf(),
            ignore_restore_errors: false,
        }),
    }
}

pub fn container_descriptor(backup_dir: &Path) -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: "172.17.0.1".into(),
        port: None,
        name: "uni".into(),
        user: "postgres".into(),
        password: "postgres".into(),
        extras: BackendExtras::Container {
            postgres: PostgresExtras {
                backup_dir: backup_dir.to_path_buf(),
                ignore_restore_errors: true,
            },
            image: "tandemservice/postgres".into(),
            container: None,
        },
    }
}

pub fn mssql_descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor {
        host: "10.0.0.7".into(),
        port: Some(1433),
        name: "uni_fefu".into(),
        user: "sa".into(),
        password: "secret".into(),
        extras: BackendExtras::SqlServer {
            files_dir: "D:\\data".into(),
            backup_dir: "D:\\backup".into(),
        },
    }
}

type Responder = dyn Fn(&ConsoleCommand) -> StandResult<CommandOutput> + Send + Sync;

/// Records every console command and answers with `respond`.
pub struct FakeRunner {
    pub commands: Mutex<Vec<ConsoleCommand>>,
    respond: Box<Responder>,
}

impl FakeRunner {
    pub fn new(respond: impl Fn(&ConsoleCommand) -> StandResult<CommandOutput> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Ok(CommandOutput::ok("")))
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands.lock().iter().map(|c| c.program.clone()).collect()
    }

    /// Commands whose arguments contain `needle`.
    pub fn matching(&self, needle: &str) -> Vec<ConsoleCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.args.iter().any(|a| a.contains(needle)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &ConsoleCommand) -> StandResult<CommandOutput> {
        self.commands.lock().push(command.clone());
        (self.respond)(command)
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub running: bool,
    pub host_port: u16,
}

/// In-memory container engine.
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub fail_start: AtomicBool,
    pub fail_export: AtomicBool,
    pub imports: Mutex<Vec<(String, String, PathBuf)>>,
    pub exports: Mutex<Vec<(String, String)>>,
    next_id: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.containers.lock().len()
    }

    fn find(&self, container: &str) -> Option<String> {
        let containers = self.containers.lock();
        containers
            .iter()
            .find(|(id, c)| id.as_str() == container || c.name == container)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("c{n:04}");
        let name = spec.name.clone().unwrap_or_else(|| format!("stand_db_{n}"));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                name,
                running: false,
                host_port: spec.host_port,
            },
        );
        Ok(id)
    }

    async fn start(&self, container: &str) -> RuntimeResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Io(std::io::Error::other("port is already allocated")));
        }
        let id = self.find(container).ok_or_else(|| RuntimeError::NotFound(container.into()))?;
        if let Some(c) = self.containers.lock().get_mut(&id) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> RuntimeResult<()> {
        let id = self.find(container).ok_or_else(|| RuntimeError::NotFound(container.into()))?;
        if let Some(c) = self.containers.lock().get_mut(&id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> RuntimeResult<()> {
        let id = self.find(container).ok_or_else(|| RuntimeError::NotFound(container.into()))?;
        self.containers.lock().remove(&id);
        Ok(())
    }

    async fn name_of(&self, container: &str) -> RuntimeResult<String> {
        let id = self.find(container).ok_or_else(|| RuntimeError::NotFound(container.into()))?;
        Ok(self.containers.lock()[&id].name.clone())
    }

    async fn export_archive(&self, container: &str, source: &str, dest: &Path) -> RuntimeResult<()> {
        if self.fail_export.load(Ordering::SeqCst) {
            return Err(RuntimeError::Io(std::io::Error::other("no space left on device")));
        }
        std::fs::write(dest, tar_bytes())?;
        self.exports.lock().push((container.into(), source.into()));
        Ok(())
    }

    async fn import_archive(&self, container: &str, dest_dir: &str, archive: &Path) -> RuntimeResult<()> {
        self.find(container).ok_or_else(|| RuntimeError::NotFound(container.into()))?;
        self.imports
            .lock()
            .push((container.into(), dest_dir.into(), archive.to_path_buf()));
        Ok(())
    }
}

/// One 512-byte ustar header block.
pub fn tar_bytes() -> Vec<u8> {
    let mut block = vec![0u8; 1024];
    block[..10].copy_from_slice(b"PG_VERSION");
    block[257..263].copy_from_slice(b"ustar\0");
    block
}

/// Minimal valid war with one entry.
pub fn war_bytes() -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("WEB-INF/web.xml", options).unwrap();
        zip.write_all(b"<web-app/>").unwrap();
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// Build server with one job whose build finishes after `running_polls` polls.
pub struct FakeBuildServer {
    pub next_number: u64,
    pub running_polls: u32,
    pub result: String,
    pub artifact: Vec<u8>,
    pub polls: AtomicU32,
    pub triggered: Mutex<Vec<Option<String>>>,
    pub downloads: AtomicU32,
}

impl FakeBuildServer {
    pub fn new(next_number: u64, running_polls: u32) -> Arc<Self> {
        Arc::new(Self {
            next_number,
            running_polls,
            result: "SUCCESS".into(),
            artifact: war_bytes(),
            polls: AtomicU32::new(0),
            triggered: Mutex::new(Vec::new()),
            downloads: AtomicU32::new(0),
        })
    }

    pub fn build(&self, number: u64, running: bool) -> BuildInfo {
        BuildInfo {
            number,
            running,
            result: (!running).then(|| self.result.clone()),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 5, 9, 20, 0).unwrap(),
            artifacts: vec![Artifact {
                file_name: "uni.war".into(),
                relative_path: "build/libs/uni.war".into(),
            }],
        }
    }
}

#[async_trait]
impl BuildServer for FakeBuildServer {
    async fn next_build_number(&self, _project: &str) -> BuildServerResult<u64> {
        Ok(self.next_number)
    }

    async fn trigger(&self, _project: &str, version: Option<&str>) -> BuildServerResult<()> {
        self.triggered.lock().push(version.map(str::to_string));
        Ok(())
    }

    async fn build_info(&self, _project: &str, number: Option<u64>) -> BuildServerResult<Option<BuildInfo>> {
        let number = number.unwrap_or(self.next_number);
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(self.build(number, polls < self.running_polls)))
    }

    async fn download_artifact(
        &self,
        _project: &str,
        _number: u64,
        _artifact: &Artifact,
        dest: &Path,
    ) -> BuildServerResult<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, &self.artifact).await?;
        Ok(())
    }
}

/// Process double counting start/stop calls.
#[derive(Default)]
pub struct FakeProcess {
    pub running: AtomicBool,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl FakeProcess {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    async fn start(&self) -> StandResult<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self) -> StandResult<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn state(&self) -> ProcessState {
        if self.running.load(Ordering::SeqCst) {
            ProcessState::Running { pid: 4242 }
        } else {
            ProcessState::NotStarted
        }
    }
}

pub struct FakeProbe {
    pub responding: AtomicBool,
    /// Never answer, like a server that accepted the connection and hangs.
    pub hang: AtomicBool,
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn responding(&self) -> bool {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.responding.load(Ordering::SeqCst)
    }
}

/// Database backend that can block inside operations and fail on demand.
pub struct FakeBackend {
    descriptor: ConnectionDescriptor,
    pub calls: Mutex<Vec<&'static str>>,
    pub fail: Mutex<Option<&'static str>>,
    pub has_backup: AtomicBool,
    /// When set, every operation waits for a permit before finishing.
    pub gate: Option<Arc<Semaphore>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            has_backup: AtomicBool::new(false),
            gate: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    async fn op(&self, name: &'static str) -> StandResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(name);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if *self.fail.lock() == Some(name) {
            return Err(StandError::backend(name, "simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for FakeBackend {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    async fn create(&self) -> StandResult<()> {
        self.op("create").await
    }

    async fn drop_database(&self) -> StandResult<()> {
        self.op("drop").await
    }

    async fn backup(&self) -> StandResult<()> {
        self.op("backup").await
    }

    async fn has_default_backup(&self) -> bool {
        self.has_backup.load(Ordering::SeqCst)
    }

    async fn restore(&self) -> StandResult<()> {
        self.op("restore").await
    }

    async fn reduce(&self) -> StandResult<()> {
        self.op("reduce").await
    }

    async fn customer_patch(&self) -> StandResult<()> {
        self.op("customer_patch").await
    }

    async fn normalize_auth(&self) -> StandResult<()> {
        self.op("normalize_auth").await
    }
}

pub struct Stand {
    pub engine: Arc<Engine>,
    pub db: Arc<FakeBackend>,
    pub process: Arc<FakeProcess>,
    pub builds: Arc<FakeBuildServer>,
    pub health_check: Arc<FakeProbe>,
    pub layout: StandLayout,
    _work_dir: tempfile::TempDir,
}

/// Engine over fakes, rooted in a fresh temporary work dir.
pub fn stand(db: FakeBackend, builds: Arc<FakeBuildServer>) -> Stand {
    stand_with(db, builds, EngineSettings::default())
}

pub fn stand_with(db: FakeBackend, builds: Arc<FakeBuildServer>, settings: EngineSettings) -> Stand {
    stand_with_health(db, builds, settings, fast_poll())
}

pub fn stand_with_health(
    db: FakeBackend,
    builds: Arc<FakeBuildServer>,
    settings: EngineSettings,
    health: RetryPolicy,
) -> Stand {
    let work_dir = tempfile::tempdir().unwrap();
    let layout = StandLayout::new(work_dir.path());
    stand_tools::engine::files::prepare_layout(&layout).unwrap();

    let db = Arc::new(db);
    let process = FakeProcess::new();
    let client = BuildClient::new(builds.clone(), "product_uni", Some("2.14".into()), 5)
        .unwrap()
        .with_poll_policy(fast_poll());
    let probe = Arc::new(FakeProbe {
        responding: AtomicBool::new(true),
        hang: AtomicBool::new(false),
    });
    let engine = Engine::new(
        db.clone(),
        process.clone(),
        client,
        probe.clone(),
        layout.clone(),
        settings,
    )
    .with_health_policy(health);

    Stand {
        engine: Arc::new(engine),
        db,
        process,
        builds,
        health_check: probe,
        layout,
        _work_dir: work_dir,
    }
}
