//! Configuration error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown top-level configuration key(s): {0}")]
    UnknownTopLevelKeys(String),

    #[error("no credentials configured: set --polaris-api-key, POLARIS_API_KEY, POLARIS_KEY_FILE, or polaris.api_key")]
    NoCredentials,

    #[error("failed to read key file {path}: {source}")]
    KeyFile { path: String, source: std::io::Error },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}
