pub mod command;
pub mod format;
pub mod mssql;
pub mod postgres;
pub mod types;

use std::sync::Arc;

use crate::container::{ContainerizedPostgres, DockerRuntime};
use crate::error::{StandError, StandResult};
use command::{CommandRunner, SystemRunner};
use mssql::RemoteSqlServer;
use postgres::RemotePostgres;
pub use types::{BackendExtras, ConnectionDescriptor, DatabaseBackend, OperationTimeouts};

/// Build the backend matching the descriptor's flavour.
pub async fn open_backend(
    descriptor: ConnectionDescriptor,
    timeouts: OperationTimeouts,
) -> StandResult<Arc<dyn DatabaseBackend>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    tracing::info!(db_type = %descriptor.db_type(), host = %descriptor.host, name = %descriptor.name, "Open database backend");

    let backend: Arc<dyn DatabaseBackend> = match &descriptor.extras {
        BackendExtras::SqlServer { .. } => Arc::new(RemoteSqlServer::new(descriptor, runner, timeouts)?),
        BackendExtras::Postgres(_) => Arc::new(RemotePostgres::new(descriptor, runner, timeouts)?),
        BackendExtras::Container { .. } => {
            let runtime = DockerRuntime::connect()
                .map_err(|e| StandError::backend("connect to docker", e))?;
            Arc::new(ContainerizedPostgres::attach(descriptor, runner, Arc::new(runtime), timeouts).await?)
        }
    };
    Ok(backend)
}
