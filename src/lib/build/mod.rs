pub mod client;
pub mod jenkins;
pub mod types;

pub use client::BuildClient;
pub use jenkins::JenkinsApi;
pub use types::{Artifact, BuildDescriptor, BuildInfo, BuildServer, BuildServerError};
