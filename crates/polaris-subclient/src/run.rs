//! Dispatch logic for the `polaris-device-subclient` binary: config
//! resolution, `--dry-run`/`--validate-config` short-circuits, and the
//! normal run wiring connection manager -> pipeline.

use std::time::Duration;

use polaris_api::{ConnectionConfig, ConnectionManager};
use polaris_core::{Pipeline, Writer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::error::CliError;

const RAW_CHANNEL_CAPACITY: usize = 1024;
const DRY_RUN_RECORD_LIMIT: usize = 5;

pub async fn run(cli: Cli) -> Result<(), CliError> {
    if let Some(shell) = cli.completions {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "polaris-device-subclient", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = polaris_config::resolve_config_path(cli.config.as_deref());
    let figment = polaris_config::load_figment(&config_path)?;
    let config = polaris_config::finalize(&figment)?;

    let api_url = polaris_config::validate_api_url(&config, cli.polaris_api_url.as_deref())?;
    let api_key = polaris_config::resolve_api_key(&config, cli.polaris_api_key.as_deref())?;

    if cli.validate_config {
        tracing::info!("configuration is valid");
        return Ok(());
    }

    let output_mode_override = cli.output.map(|m| match m {
        crate::cli::OutputMode::Stdout => "stdout",
        crate::cli::OutputMode::File => "file",
    });
    let writer_config =
        polaris_config::to_writer_config(&config, cli.output_dir.clone(), output_mode_override)?;
    let filter_config = polaris_config::to_filter_config(&config);

    let writer = Writer::new(writer_config).map_err(CliError::from)?;
    let pipeline = Pipeline::new(config.polaris.instance_id.clone(), filter_config, writer);

    let reconnect = polaris_api::ReconnectPolicy {
        initial_delay: Duration::from_millis(config.polaris.reconnect.initial_delay_ms),
        max_delay: Duration::from_millis(config.polaris.reconnect.max_delay_ms),
        backoff_multiplier: config.polaris.reconnect.backoff_multiplier,
        jitter_pct: config.polaris.reconnect.jitter_pct,
    };
    let connection_config = ConnectionConfig { api_url, api_key, reconnect };

    let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    if cli.dry_run {
        return dry_run(connection_config, raw_tx, raw_rx, cancel).await;
    }

    let connection = ConnectionManager::spawn(connection_config, raw_tx, cancel.clone());
    let pipeline = pipeline.with_connection_status(connection.state_receiver());
    let pipeline_handle = tokio::spawn(pipeline.run(raw_rx, cancel.clone()));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight records");
    connection.shutdown();
    cancel.cancel();

    let _writer = pipeline_handle
        .await
        .map_err(|e| CliError::Unexpected(format!("pipeline task panicked: {e}")))?;
    Ok(())
}

/// `--dry-run`: connect, collect the first [`DRY_RUN_RECORD_LIMIT`] records
/// through the normalizer/filter, print them to stdout, then exit.
async fn dry_run(
    connection_config: ConnectionConfig,
    raw_tx: mpsc::Sender<polaris_api::RawMessage>,
    mut raw_rx: mpsc::Receiver<polaris_api::RawMessage>,
    cancel: CancellationToken,
) -> Result<(), CliError> {
    let connection = ConnectionManager::spawn(connection_config, raw_tx, cancel.clone());
    let mut session = None;
    let mut emitted = 0;

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    while emitted < DRY_RUN_RECORD_LIMIT {
        tokio::select! {
            biased;
            () = &mut deadline => {
                connection.shutdown();
                return Err(CliError::DryRunFailed(polaris_api::Error::Dial {
                    url: "dry-run".into(),
                    reason: "timed out waiting for the first records".into(),
                }));
            }
            maybe = raw_rx.recv() => {
                let Some(raw) = maybe else {
                    connection.shutdown();
                    return Err(CliError::DryRunFailed(polaris_api::Error::Dial {
                        url: "dry-run".into(),
                        reason: "connection closed before any records arrived".into(),
                    }));
                };
                if session.as_ref().is_none_or(|s: &polaris_core::SessionState| s.subscription_id != raw.subscription_id) {
                    let reconnect_attempt = connection.state().reconnect_attempt;
                    session = Some(polaris_core::SessionState::with_reconnect_attempt(
                        raw.subscription_id.clone(),
                        reconnect_attempt,
                    ));
                }
                let record = polaris_core::normalize(&raw, "dry-run", session.as_mut().expect("just set"));
                if let Ok(line) = record.to_ndjson_line() {
                    println!("{line}");
                }
                emitted += 1;
            }
        }
    }

    connection.shutdown();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
