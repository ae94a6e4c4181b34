//! Clap derive structures for the `polaris-device-subclient` CLI.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// polaris-device-subclient -- GraphQL subscription to NDJSON bridge
#[derive(Debug, Parser)]
#[command(
    name = "polaris-device-subclient",
    version,
    about = "Streams device state changes from a GraphQL subscription to NDJSON",
    propagate_version = true
)]
pub struct Cli {
    /// Config file path
    #[arg(long, env = "POLARIS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Writer mode
    #[arg(long, env = "POLARIS_OUTPUT", value_enum)]
    pub output: Option<OutputMode>,

    /// Override output.file.output_dir
    #[arg(long, env = "POLARIS_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Overrides logging.level
    #[arg(long, env = "POLARIS_LOG_LEVEL", value_enum)]
    pub log_level: Option<LogLevel>,

    /// Connect, emit the first 5 records to stdout, then exit
    #[arg(long)]
    pub dry_run: bool,

    /// Parse config and resolve credentials without opening a network connection
    #[arg(long)]
    pub validate_config: bool,

    /// Polaris API key (overrides POLARIS_API_KEY / POLARIS_KEY_FILE / config)
    #[arg(long, env = "POLARIS_API_KEY", hide_env_values = true)]
    pub polaris_api_key: Option<String>,

    /// Polaris API URL (overrides polaris.api_url)
    #[arg(long, env = "POLARIS_API_URL")]
    pub polaris_api_url: Option<String>,

    /// Print a shell completion script to stdout and exit
    #[arg(long, value_enum)]
    pub completions: Option<clap_complete::Shell>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputMode {
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
