use std::path::PathBuf;
use thiserror::Error;

/// Core error type for configuration and setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidConfig { key: String, value: String },

    #[error("Project root not found from {start}")]
    ProjectNotFound { start: PathBuf },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    #[must_use]
    pub fn invalid_config(key: &str, value: &str) -> Self {
        Self::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
