//! Top-level CLI error type and process exit codes (spec §6, §7).

use miette::Diagnostic;
use thiserror::Error;

/// Exit codes per the process-level error policy table.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const UNEXPECTED: i32 = 1;
    pub const CONFIG_INVALID: i32 = 2;
    pub const FATAL_IO: i32 = 3;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(polaris::config),
        help("check --config, environment variables, and the config file for typos")
    )]
    Config(#[from] polaris_config::ConfigError),

    #[error("fatal I/O error: {0}")]
    #[diagnostic(
        code(polaris::fatal_io),
        help("verify the output directory exists and is writable by this process")
    )]
    FatalIo(String),

    /// `--dry-run` failed to connect or never received a record. Spec §6
    /// documents this as exiting with the same code as a configuration
    /// problem, since a dry run exists precisely to validate the endpoint
    /// and credentials before a real run is attempted.
    #[error("dry run failed: {0}")]
    #[diagnostic(
        code(polaris::dry_run),
        help("check --polaris-api-url, credentials, and network reachability to the endpoint")
    )]
    DryRunFailed(#[from] polaris_api::Error),

    #[error("pipeline error: {0}")]
    #[diagnostic(code(polaris::pipeline))]
    Pipeline(String),

    #[error("unexpected error: {0}")]
    #[diagnostic(code(polaris::unexpected))]
    Unexpected(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::DryRunFailed(_) => exit_code::CONFIG_INVALID,
            Self::FatalIo(_) => exit_code::FATAL_IO,
            Self::Pipeline(_) | Self::Unexpected(_) => exit_code::UNEXPECTED,
        }
    }
}

impl From<polaris_core::CoreError> for CliError {
    fn from(err: polaris_core::CoreError) -> Self {
        if err.is_fatal_io() {
            Self::FatalIo(err.to_string())
        } else {
            Self::Unexpected(err.to_string())
        }
    }
}
