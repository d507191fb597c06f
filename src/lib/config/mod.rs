pub mod loader;
pub mod logging;
pub mod types;

pub use types::{DbType, StandConfig, StandLayout};
