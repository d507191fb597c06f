//! Configuration loading: TOML file, then environment overlay, then
//! validation.
//!
//! Priority, highest first: process environment > config file > defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::types::{DbType, StandConfig, StandLayout};
use crate::backend::types::{BackendExtras, ConnectionDescriptor, PostgresExtras};
use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "STAND_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/stand.toml";

const DEFAULT_PGDOCKER_IP: &str = "172.17.0.1";
const DEFAULT_PGDOCKER_NAME: &str = "uni";
const DEFAULT_PGDOCKER_CREDENTIAL: &str = "postgres";
const DEFAULT_PGDOCKER_IMAGE: &str = "tandemservice/postgres";

impl StandConfig {
    /// Load from `path` (absent file means defaults), overlay the process
    /// environment and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::parse_toml(&raw)?
        } else {
            Self::default()
        };

        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay `key=value` pairs whose lowercased key is a known parameter.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let key = key.to_ascii_lowercase();
            match key.as_str() {
                "log_level" => self.log_level = value,
                "log_format" => self.log_format = value,
                "db_type" => {
                    self.db_type = DbType::from_str(&value).map_err(|_| invalid(&key, &value))?
                }
                "engine_host" => self.engine_host = value,
                "engine_port" => self.engine_port = parse(&key, &value)?,
                "work_dir" => self.work_dir = PathBuf::from(value),
                "app_command" => self.application.command = value,
                "app_port" => self.application.port = parse(&key, &value)?,
                "catalina_opts" => self.application.catalina_opts = Some(value),
                "db_ip" => self.db.ip = Some(value),
                "db_port" => self.db.port = Some(parse(&key, &value)?),
                "db_name" => self.db.name = Some(value),
                "db_user" => self.db.user = Some(value),
                "db_password" => self.db.password = Some(value),
                "db_backup_dir" => self.db.backup_dir = Some(PathBuf::from(value)),
                "db_rm" => self.db.rm = parse_bool(&key, &value)?,
                "db_validate_entity_code" => {
                    self.db.validate_entity_code = parse_bool(&key, &value)?
                }
                "db_mssql_db_dir" => self.db.mssql_db_dir = Some(value),
                "db_postgres_ignore_restore_errors" => {
                    self.db.postgres_ignore_restore_errors = Some(parse_bool(&key, &value)?)
                }
                "db_container" => self.db.container = Some(value),
                "db_pgdocker_image" => self.db.pgdocker_image = Some(value),
                "jenkins_url" => self.jenkins.url = Some(value),
                "jenkins_user" => self.jenkins.user = Some(value),
                "jenkins_password" => self.jenkins.password = Some(value),
                "jenkins_project" => self.jenkins.project = value,
                "jenkins_branch" => self.jenkins.branch = Some(value),
                "jenkins_utc_offset_hours" => self.jenkins.utc_offset_hours = parse(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Check that every required parameter resolved to a value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection_descriptor()?;
        required("jenkins_url", &self.jenkins.url)?;
        required("jenkins_user", &self.jenkins.user)?;
        required("jenkins_password", &self.jenkins.password)?;
        if !(-12..=14).contains(&self.jenkins.utc_offset_hours) {
            return Err(invalid(
                "jenkins_utc_offset_hours",
                &self.jenkins.utc_offset_hours.to_string(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> StandLayout {
        StandLayout::new(&self.work_dir).with_template_config_dir(self.template_config_dir.clone())
    }

    /// Resolve the database section into a descriptor, applying the
    /// defaults of the configured backend.
    pub fn connection_descriptor(&self) -> Result<ConnectionDescriptor, ConfigError> {
        let db = &self.db;
        let backup_dir = db
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.layout().default_backup_dir());

        match self.db_type {
            DbType::Mssql => {
                let backup_dir = db
                    .backup_dir
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .ok_or_else(|| ConfigError::Missing("db_backup_dir".into()))?;
                Ok(ConnectionDescriptor {
                    host: required("db_ip", &db.ip)?,
                    port: Some(db.port.unwrap_or(DbType::Mssql.default_port())),
                    name: required("db_name", &db.name)?,
                    user: required("db_user", &db.user)?,
                    password: required("db_password", &db.password)?,
                    extras: BackendExtras::SqlServer {
                        files_dir: required("db_mssql_db_dir", &db.mssql_db_dir)?,
                        backup_dir,
                    },
                })
            }
            DbType::Postgres => Ok(ConnectionDescriptor {
                host: required("db_ip", &db.ip)?,
                port: Some(db.port.unwrap_or(DbType::Postgres.default_port())),
                name: required("db_name", &db.name)?,
                user: required("db_user", &db.user)?,
                password: required("db_password", &db.password)?,
                extras: BackendExtras::Postgres(PostgresExtras {
                    backup_dir,
                    ignore_restore_errors: db.postgres_ignore_restore_errors.unwrap_or(true),
                }),
            }),
            DbType::Pgdocker => Ok(ConnectionDescriptor {
                host: db.ip.clone().unwrap_or_else(|| DEFAULT_PGDOCKER_IP.into()),
                port: db.port,
                name: db.name.clone().unwrap_or_else(|| DEFAULT_PGDOCKER_NAME.into()),
                user: db.user.clone().unwrap_or_else(|| DEFAULT_PGDOCKER_CREDENTIAL.into()),
                password: db
                    .password
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PGDOCKER_CREDENTIAL.into()),
                extras: BackendExtras::Container {
                    postgres: PostgresExtras {
                        backup_dir,
                        ignore_restore_errors: db.postgres_ignore_restore_errors.unwrap_or(true),
                    },
                    image: db
                        .pgdocker_image
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PGDOCKER_IMAGE.into()),
                    container: db.container.clone().filter(|name| !name.is_empty()),
                },
            }),
        }
    }

    /// Log every resolved parameter except secrets.
    pub fn log_summary(&self) {
        tracing::info!(
            db_type = %self.db_type,
            log_level = %self.log_level,
            engine_host = %self.engine_host,
            engine_port = self.engine_port,
            work_dir = %self.work_dir.display(),
            "Stand configuration"
        );
        tracing::info!(
            command = %self.application.command,
            args = ?self.application.args,
            port = self.application.port,
            catalina_opts = ?self.application.catalina_opts,
            "Application configuration"
        );
        tracing::info!(
            ip = ?self.db.ip,
            port = ?self.db.port,
            name = ?self.db.name,
            user = ?self.db.user,
            backup_dir = ?self.db.backup_dir,
            validate_entity_code = self.db.validate_entity_code,
            rm = self.db.rm,
            container = ?self.db.container,
            image = ?self.db.pgdocker_image,
            "Database configuration"
        );
        tracing::info!(
            url = ?self.jenkins.url,
            user = ?self.jenkins.user,
            project = %self.jenkins.project,
            branch = ?self.jenkins.branch,
            "Build server configuration"
        );
    }
}

fn required(key: &str, value: &Option<String>) -> Result<String, ConfigError> {
    value
        .as_ref()
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn jenkins_vars() -> Vec<(String, String)> {
        vars(&[
            ("JENKINS_URL", "http://ci.local"),
            ("JENKINS_USER", "bot"),
            ("JENKINS_PASSWORD", "secret"),
        ])
    }

    #[test]
    fn pgdocker_defaults_fill_the_descriptor() {
        let mut config = StandConfig::default();
        config.apply_overrides(jenkins_vars()).unwrap();
        config.validate().unwrap();

        let descriptor = config.connection_descriptor().unwrap();
        assert_eq!(descriptor.host, "172.17.0.1");
        assert_eq!(descriptor.name, "uni");
        assert_eq!(descriptor.port, None);
        match descriptor.extras {
            BackendExtras::Container {
                image,
                container,
                postgres,
            } => {
                assert_eq!(image, "tandemservice/postgres");
                assert_eq!(container, None);
                assert!(postgres.ignore_restore_errors);
                assert!(postgres.backup_dir.ends_with("backup"));
            }
            other => panic!("unexpected extras {other:?}"),
        }
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = StandConfig::parse_toml(
            r#"
            db_type = "postgres"

            [db]
            ip = "10.0.0.1"
            name = "from_file"
            user = "u"
            password = "p"
            "#,
        )
        .unwrap();
        let mut overrides = jenkins_vars();
        overrides.extend(vars(&[("DB_NAME", "from_env"), ("db_rm", "true"), ("UNRELATED", "x")]));
        config.apply_overrides(overrides).unwrap();

        let descriptor = config.connection_descriptor().unwrap();
        assert_eq!(descriptor.name, "from_env");
        assert_eq!(descriptor.port, Some(5432));
        assert!(config.db.rm);
    }

    #[test]
    fn mssql_requires_files_dir() {
        let mut config = StandConfig::default();
        config
            .apply_overrides(vars(&[
                ("db_type", "mssql"),
                ("db_ip", "sql.local"),
                ("db_name", "uni_fefu"),
                ("db_user", "sa"),
                ("db_password", "pw"),
                ("db_backup_dir", "D:\\backup"),
            ]))
            .unwrap();

        let err = config.connection_descriptor().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "db_mssql_db_dir"));
    }

    #[test]
    fn missing_jenkins_credentials_fail_validation() {
        let config = StandConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(key)) if key == "jenkins_url"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut config = StandConfig::default();
        let err = config
            .apply_overrides(vars(&[("db_port", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = config
            .apply_overrides(vars(&[("db_type", "oracle")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
