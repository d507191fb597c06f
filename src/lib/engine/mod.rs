#[allow(clippy::module_inception)]
pub mod engine;
pub mod files;
pub mod health;
pub mod status;
pub mod types;

pub use engine::Engine;
pub use health::{HealthProbe, HttpProbe};
pub use types::{EngineSettings, StatusReport, TaskKind, TaskStatus, Workflow};
