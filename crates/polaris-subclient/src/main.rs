mod cli;
mod error;
mod run;

use std::path::{Path, PathBuf};

use clap::Parser;
use polaris_core::RedactingJsonFormatter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = polaris_config::resolve_config_path(cli.config.as_deref());
    let (redactor, level, operational_log_path) = match polaris_config::load_figment(&config_path)
        .and_then(|f| polaris_config::finalize(&f))
    {
        Ok(config) => {
            let level = cli
                .log_level
                .map(cli::LogLevel::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| config.logging.level.clone());
            let operational_log_path = config.logging.operational_log_path.clone();
            (polaris_config::to_redactor(&config), level, operational_log_path)
        }
        Err(_) => {
            // Config is invalid; fall back to defaults so the error below
            // is itself logged (and redacted) before `run` re-surfaces it.
            let level = cli.log_level.map(cli::LogLevel::as_str).unwrap_or("info").to_string();
            (polaris_config::to_redactor(&polaris_config::Config::default()), level, None)
        }
    };
    let _operational_log_guard = init_tracing(&level, redactor, operational_log_path.as_deref());

    if let Err(err) = run::run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Installs the stdout log subscriber and, when `operational_log_path` is
/// set, a second subscriber writing to a `tracing-appender` daily-rolling
/// file (spec's ambient operational log, distinct from the NDJSON record
/// output). The returned guard must be held for the process lifetime --
/// dropping it flushes and stops the background writer thread.
fn init_tracing(
    level: &str,
    redactor: polaris_core::Redactor,
    operational_log_path: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stdout_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_layer =
        fmt::layer().event_format(RedactingJsonFormatter::new(redactor.clone())).with_filter(stdout_filter);

    let (file_layer, guard) = match operational_log_path {
        Some(path) => {
            let (directory, file_name) = split_log_path(path);
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_filter = EnvFilter::new(level);
            let layer = fmt::layer()
                .event_format(RedactingJsonFormatter::new(redactor))
                .with_writer(non_blocking)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stdout_layer).with(file_layer).init();
    guard
}

/// Splits an `operational_log_path` into the directory and base file name
/// `tracing_appender::rolling` wants; it appends its own date suffix and
/// manages numbered backups from there.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "polaris-device-subclient.log".to_string());
    (directory.to_path_buf(), file_name)
}
