pub mod docker;
pub mod identity;
pub mod state;
pub mod supervisor;
pub mod types;

pub use docker::DockerRuntime;
pub use supervisor::ContainerizedPostgres;
pub use types::{ContainerIdentity, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError};
