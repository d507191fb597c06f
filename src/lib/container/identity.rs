//! Persisted `<name> <port>` record of the stand's database container.

use std::path::{Path, PathBuf};

use super::types::ContainerIdentity;
use crate::error::StandResult;

/// File name of the record inside the backup directory.
pub const IDENTITY_FILE: &str = "pgdocker_db";

#[derive(Debug, Clone)]
pub struct IdentityFile {
    path: PathBuf,
}

impl IdentityFile {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(IDENTITY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the record is absent or unreadable.
    pub fn load(&self) -> Option<ContainerIdentity> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        parse(&raw)
    }

    pub fn save(&self, identity: &ContainerIdentity) -> StandResult<()> {
        std::fs::write(&self.path, format!("{} {}", identity.name, identity.port))?;
        tracing::debug!(path = %self.path.display(), name = %identity.name, port = identity.port, "Container identity saved");
        Ok(())
    }
}

fn parse(raw: &str) -> Option<ContainerIdentity> {
    // A dropped container is recorded with an empty name: " 41234".
    let (name, port) = raw.trim_end().split_once(' ')?;
    Some(ContainerIdentity {
        name: name.to_string(),
        port: port.trim().parse().ok()?,
    })
}
