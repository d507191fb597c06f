pub mod stats;
pub mod supervisor;
pub mod types;

pub use supervisor::ProcessSupervisor;
pub use types::{ManagedProcess, ProcessReport, ProcessState};
