use std::time::Duration;

/// Errors raised while loading or validating the stand configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config parameter {0} is required")]
    Missing(String),

    #[error("config parameter {key} has invalid value {value:?}")]
    Invalid { key: String, value: String },
}

/// Failure taxonomy shared by every component of the stand.
#[derive(Debug, thiserror::Error)]
pub enum StandError {
    /// A remote command or transport call against a database backend failed.
    #[error("{operation} failed: {cause}")]
    Backend { operation: String, cause: String },

    /// A bounded wait ran out before the expected state was reached.
    #[error("timed out waiting for {what} after {elapsed:?}")]
    Timeout { what: String, elapsed: Duration },

    /// The remote build or its artifact is missing, failed or malformed.
    #[error("build error: {0}")]
    Build(String),

    /// The managed application process could not be controlled.
    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StandError {
    pub fn backend(operation: impl Into<String>, cause: impl ToString) -> Self {
        StandError::Backend {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    pub fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        StandError::Timeout {
            what: what.into(),
            elapsed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StandError::Timeout { .. })
    }
}

pub type StandResult<T> = Result<T, StandError>;
