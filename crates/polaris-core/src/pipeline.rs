//! Pipeline orchestration: wires the normalizer, filter, and writer stages
//! (B -> C -> D) onto the bounded queue fed by the connection manager (A).
//!
//! Spec §5: back-pressure is owned entirely by the channel capacity chosen
//! by the caller; this module never buffers beyond what `mpsc` already
//! holds.

use std::time::Duration;

use polaris_api::{ConnectionStatus, RawMessage};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::filter::{evaluate, FilterConfig, FilterDecision};
use crate::normalizer::normalize;
use crate::session::SessionState;
use crate::writer::Writer;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Pipeline {
    instance_id: String,
    filter_config: FilterConfig,
    writer: Writer,
    connection_status: Option<watch::Receiver<ConnectionStatus>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, filter_config: FilterConfig, writer: Writer) -> Self {
        Self { instance_id: instance_id.into(), filter_config, writer, connection_status: None }
    }

    /// Attaches the connection manager's status watch so a new
    /// `SessionState` can be seeded with the transport's current reconnect
    /// attempt count (spec §3 `SessionState.reconnect_attempt`) instead of
    /// always starting at zero.
    #[must_use]
    pub fn with_connection_status(mut self, status_rx: watch::Receiver<ConnectionStatus>) -> Self {
        self.connection_status = Some(status_rx);
        self
    }

    /// Runs until `cancel` fires or the channel closes, then drains any
    /// remaining queued messages (bounded to [`DRAIN_TIMEOUT`]), flushes,
    /// and finalizes the active file before returning the writer.
    pub async fn run(mut self, mut raw_rx: mpsc::Receiver<RawMessage>, cancel: CancellationToken) -> Writer {
        let mut session: Option<SessionState> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                maybe = raw_rx.recv() => {
                    match maybe {
                        Some(raw) => self.process(raw, &mut session),
                        None => break,
                    }
                }
            }
        }

        self.drain(&mut raw_rx, &mut session).await;
        let _ = self.writer.flush_now();
        let _ = self.writer.finalize_current();
        self.writer
    }

    async fn drain(&mut self, raw_rx: &mut mpsc::Receiver<RawMessage>, session: &mut Option<SessionState>) {
        let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => {
                    tracing::warn!("drain deadline of 5s exceeded, finalizing with what has been processed");
                    break;
                }
                maybe = raw_rx.recv() => {
                    match maybe {
                        Some(raw) => self.process(raw, session),
                        None => break,
                    }
                }
            }
        }
    }

    fn process(&mut self, raw: RawMessage, session: &mut Option<SessionState>) {
        let needs_new_session = match session {
            Some(s) => s.subscription_id != raw.subscription_id,
            None => true,
        };
        if needs_new_session {
            let reconnect_attempt =
                self.connection_status.as_ref().map(|rx| rx.borrow().reconnect_attempt).unwrap_or(0);
            *session = Some(SessionState::with_reconnect_attempt(raw.subscription_id.clone(), reconnect_attempt));
        }
        let session = session.as_mut().expect("just initialized above");

        let record = normalize(&raw, &self.instance_id, session);
        match evaluate(&record, &self.filter_config) {
            FilterDecision::Keep => {
                if let Err(e) = self.writer.write_record(&record) {
                    tracing::error!(error = %e, "failed to persist record");
                }
            }
            FilterDecision::Drop => {
                tracing::debug!(
                    event_type = record.event_type(),
                    device_id = record.device_id(),
                    "event_dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{OutputMode, WriterConfig};
    use std::fs;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> WriterConfig {
        WriterConfig {
            mode: OutputMode::File,
            output_dir: dir.to_path_buf(),
            file_prefix: "polaris".into(),
            instance_id: "writer-01".into(),
            rotate_interval: Duration::from_secs(3600),
            rotate_max_size_bytes: 1_000_000,
            flush_every_n_events: 1,
            flush_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn cancellation_drains_queue_before_finalizing() {
        let dir = tempdir().unwrap();
        let writer = Writer::new(config(dir.path())).unwrap();
        let pipeline = Pipeline::new("writer-01", FilterConfig::default(), writer);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for i in 0..3 {
            tx.send(RawMessage::new(
                format!(r#"{{"deviceStateChanged":{{"device":{{"id":"d{i}"}},"currentState":"CONNECTED"}}}}"#)
                    .into_bytes(),
                "sub-1",
            ))
            .await
            .unwrap();
        }
        drop(tx);
        cancel.cancel();

        let _writer = pipeline.run(rx, cancel).await;

        let mut entries: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        entries.sort();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].to_string_lossy().ends_with(".ndjson"));
        let contents = fs::read_to_string(&entries[0]).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn dropped_records_never_reach_the_writer() {
        let dir = tempdir().unwrap();
        let writer = Writer::new(config(dir.path())).unwrap();
        let filter = FilterConfig { drop_states: ["UNDEFINED".into()].into(), ..Default::default() };
        let pipeline = Pipeline::new("writer-01", filter, writer);

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        for state in ["CONNECTED", "UNDEFINED", "CONNECTED"] {
            tx.send(RawMessage::new(
                format!(r#"{{"deviceStateChanged":{{"device":{{"id":"d1"}},"currentState":"{state}"}}}}"#)
                    .into_bytes(),
                "sub-1",
            ))
            .await
            .unwrap();
        }
        drop(tx);
        cancel.cancel();

        let _writer = pipeline.run(rx, cancel).await;
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().path()).collect();
        let contents = fs::read_to_string(&entries[0]).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
