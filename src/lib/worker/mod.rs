pub mod api;
pub mod types;
#[allow(clippy::module_inception)]
pub mod worker;

pub use types::{Action, StandServer, Worker};
