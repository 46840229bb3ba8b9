use crate::pkg::{LockfileError, PkgError};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for knit-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for knit operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for config key '{key}': {value}")]
    ConfigValue { key: String, value: String },

    #[error("Project root not found from {start}")]
    ProjectNotFound { start: PathBuf },

    #[error(transparent)]
    Pkg(#[from] PkgError),

    #[error(transparent)]
    Lockfile(#[from] LockfileError),
}

impl Error {
    /// Stable machine-readable code for JSON output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO_ERROR",
            Self::ConfigValue { .. } => "CONFIG_INVALID",
            Self::ProjectNotFound { .. } => "PROJECT_NOT_FOUND",
            Self::Pkg(e) => e.code(),
            Self::Lockfile(e) => e.code(),
        }
    }
}
