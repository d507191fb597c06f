//! Files the stand writes for the managed application.

use std::path::Path;

use crate::backend::ConnectionDescriptor;
use crate::build::BuildDescriptor;
use crate::config::{DbType, StandLayout};
use crate::error::StandResult;

const POSTGRES_TEMPLATE: &str = include_str!("../../../templates/postgres_hibernate.properties");
const MSSQL_TEMPLATE: &str = include_str!("../../../templates/mssql_hibernate.properties");

/// Connection properties for the application, rendered from the backend's template.
pub fn render_db_properties(descriptor: &ConnectionDescriptor, validate_entity_code: bool) -> String {
    let template = match descriptor.db_type() {
        DbType::Mssql => MSSQL_TEMPLATE,
        DbType::Postgres | DbType::Pgdocker => POSTGRES_TEMPLATE,
    };
    let mut properties = template
        .replace("{addr}", &descriptor.host)
        .replace("{port}", &descriptor.effective_port().to_string())
        .replace("{name}", &descriptor.name)
        .replace("{user}", &descriptor.user)
        .replace("{password}", &descriptor.password);
    if !validate_entity_code {
        properties.push_str("\ndb.validateEntityCode=false\n");
    }
    properties
}

pub async fn write_db_properties(
    layout: &StandLayout,
    descriptor: &ConnectionDescriptor,
    validate_entity_code: bool,
) -> StandResult<()> {
    tracing::debug!(path = %layout.db_properties_file.display(), "Create hibernate file");
    tokio::fs::write(
        &layout.db_properties_file,
        render_db_properties(descriptor, validate_entity_code),
    )
    .await?;
    Ok(())
}

pub fn version_marker(project: &str, branch: Option<&str>, build: &BuildDescriptor) -> String {
    format!(
        "Test tools. Jenkins job: {} {} at {}",
        project,
        branch.unwrap_or_default(),
        build
    )
}

pub async fn write_version_marker(layout: &StandLayout, marker: &str) -> StandResult<()> {
    tracing::debug!(path = %layout.version_file.display(), "Write version file");
    tokio::fs::write(&layout.version_file, marker).await?;
    Ok(())
}

/// Create the working tree, seeding the config dir from the template on first start.
pub fn prepare_layout(layout: &StandLayout) -> StandResult<()> {
    tracing::debug!(work_dir = %layout.work_dir.display(), "Create dirs");
    std::fs::create_dir_all(&layout.work_dir)?;
    if !layout.config_dir.exists() {
        match &layout.template_config_dir {
            Some(template) => copy_dir(template, &layout.config_dir)?,
            None => std::fs::create_dir_all(&layout.config_dir)?,
        }
    }
    std::fs::create_dir_all(&layout.webapp_dir)?;
    std::fs::create_dir_all(layout.default_backup_dir())?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Whether the application directory holds no deployed build.
pub async fn is_empty_dir(dir: &Path) -> StandResult<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
