pub mod backend;
pub mod build;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod process;
pub mod retry;
pub mod worker;

pub use error::{StandError, StandResult};
