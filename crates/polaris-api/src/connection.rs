//! GraphQL-over-WebSocket connection manager (spec §4.1).
//!
//! Owns the `IDLE -> DIALING -> AUTHENTICATING -> SUBSCRIBED -> DRAINING ->
//! BACKOFF -> DIALING ...` state machine, the `graphql-transport-ws`
//! handshake, and the keepalive / reconnect policy. Reconnects are
//! unbounded; hard auth failures are logged distinctly but never stop the
//! loop -- the operator decides when to give up, not this process.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::backoff::{JitterRng, ReconnectPolicy};
use crate::error::Error;
use crate::protocol::{ClientMessage, ServerMessage, SubscribePayload, DEVICE_STATE_CHANGE_QUERY};
use crate::raw::RawMessage;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_PING_AFTER: Duration = Duration::from_secs(30);
const IDLE_DISCONNECT_AFTER: Duration = Duration::from_secs(15);
const STABILITY_WINDOW: Duration = Duration::from_secs(60);

/// Current phase of the connection state machine, observable by callers
/// (e.g. `--dry-run` diagnostics) via [`ConnectionManager::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Dialing,
    Authenticating,
    Subscribed,
    Draining,
    Backoff,
}

/// Connection phase plus the reconnect attempt counter that produced it.
/// `reconnect_attempt` resets to zero after a `Subscribed` transition that
/// followed a stable (>= 60s) prior session, mirroring the session-level
/// counter callers are expected to carry forward onto their own per-session
/// state once a new subscription id appears on the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
}

/// A payload handed downstream: either a device-state frame's raw bytes, or
/// a server-originated `error` frame that the normalizer turns directly
/// into a `malformed` record with code `parse_error`.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Data(Vec<u8>),
    ServerError(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub api_url: Url,
    pub api_key: SecretString,
    pub reconnect: ReconnectPolicy,
}

/// Handle to a running connection task.
pub struct ConnectionManager {
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the connection task. `raw_tx` is the bounded queue into the
    /// pipeline -- its capacity is the back-pressure knob from spec §5.
    #[must_use]
    pub fn spawn(
        config: ConnectionConfig,
        raw_tx: mpsc::Sender<RawMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, status_rx) =
            watch::channel(ConnectionStatus { state: ConnectionState::Idle, reconnect_attempt: 0 });
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run(config, raw_tx, status_tx, task_cancel).await;
        });
        Self { status_rx, cancel }
    }

    /// Observe the current connection phase and reconnect attempt count.
    #[must_use]
    pub fn state(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// A receiver that notifies on every state transition. Callers that own
    /// per-session state (e.g. `polaris-core`'s `Pipeline`) use this to seed
    /// `SessionState::reconnect_attempt` for each new subscription id.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Signal graceful shutdown; draining semantics are handled by the task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    config: ConnectionConfig,
    raw_tx: mpsc::Sender<RawMessage>,
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut consecutive_ack_timeouts: u32 = 0;
    let mut rng = JitterRng::from_entropy();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let _ = status_tx.send(ConnectionStatus { state: ConnectionState::Dialing, reconnect_attempt: attempt });
        let subscription_id = Uuid::new_v4().to_string();

        match connect_and_subscribe(&config, &subscription_id, attempt, &raw_tx, &status_tx, &cancel).await {
            Ok(ConnectOutcome::StableDisconnect) => {
                tracing::info!(subscription_id, "ws_disconnected");
                attempt = 0;
                consecutive_ack_timeouts = 0;
            }
            Ok(ConnectOutcome::EarlyDisconnect) => {
                tracing::info!(subscription_id, attempt, "ws_disconnected");
            }
            Ok(ConnectOutcome::Cancelled) => break,
            Err(err) => {
                if matches!(err, Error::AckTimeout { .. }) {
                    consecutive_ack_timeouts += 1;
                    if consecutive_ack_timeouts >= 3 {
                        tracing::error!(
                            subscription_id,
                            attempt,
                            "authentication appears to be failing repeatedly; \
                             continuing to reconnect, operator intervention may be required"
                        );
                    }
                } else {
                    consecutive_ack_timeouts = 0;
                }
                tracing::warn!(subscription_id, attempt, error = %err, "ws_error");
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        let _ = status_tx.send(ConnectionStatus { state: ConnectionState::Backoff, reconnect_attempt: attempt });
        let delay = config.reconnect.delay_for(attempt, &mut rng);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "ws_reconnecting");

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }

    let _ = status_tx.send(ConnectionStatus { state: ConnectionState::Idle, reconnect_attempt: attempt });
}

enum ConnectOutcome {
    /// Disconnected after being subscribed for at least [`STABILITY_WINDOW`].
    StableDisconnect,
    /// Disconnected before reaching stability; backoff attempt counter
    /// keeps climbing.
    EarlyDisconnect,
    Cancelled,
}

async fn connect_and_subscribe(
    config: &ConnectionConfig,
    subscription_id: &str,
    attempt: u32,
    raw_tx: &mpsc::Sender<RawMessage>,
    status_tx: &watch::Sender<ConnectionStatus>,
    cancel: &CancellationToken,
) -> Result<ConnectOutcome, Error> {
    let request = config
        .api_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Dial {
            url: config.api_url.to_string(),
            reason: e.to_string(),
        })?;

    tracing::info!(url = %config.api_url, "dialing");
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Dial {
            url: config.api_url.to_string(),
            reason: e.to_string(),
        })?;

    let (mut write, mut read) = ws_stream.split();

    let _ =
        status_tx.send(ConnectionStatus { state: ConnectionState::Authenticating, reconnect_attempt: attempt });
    let init = ClientMessage::ConnectionInit {
        payload: serde_json::json!({ "Authorization": format!("Bearer {}", config.api_key.expose_secret()) }),
    };
    send(&mut write, &init).await?;

    let ack = tokio::time::timeout(ACK_TIMEOUT, wait_for_ack(&mut read)).await;
    match ack {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::AckTimeout { timeout_secs: ACK_TIMEOUT.as_secs() }),
    }

    let subscribe = ClientMessage::Subscribe {
        id: subscription_id.to_string(),
        payload: SubscribePayload { query: DEVICE_STATE_CHANGE_QUERY.into() },
    };
    send(&mut write, &subscribe).await?;
    let _ = status_tx.send(ConnectionStatus { state: ConnectionState::Subscribed, reconnect_attempt: attempt });
    tracing::info!(subscription_id, attempt, "ws_connected");
    let subscribed_at = Instant::now();

    let mut last_frame = Instant::now();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ =
                    status_tx.send(ConnectionStatus { state: ConnectionState::Draining, reconnect_attempt: attempt });
                let complete = ClientMessage::Complete { id: subscription_id.to_string() };
                let _ = send(&mut write, &complete).await;
                return Ok(ConnectOutcome::Cancelled);
            }
            () = tokio::time::sleep(IDLE_PING_AFTER.saturating_sub(last_frame.elapsed())), if last_frame.elapsed() < IDLE_PING_AFTER => {}
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        last_frame = Instant::now();
                        if let Some(outcome) = handle_text_frame(
                            &text, raw_tx, subscription_id, &mut write, subscribed_at,
                        ).await? {
                            return Ok(outcome);
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(payload))) => {
                        last_frame = Instant::now();
                        let _ = write.send(tungstenite::Message::Pong(payload)).await;
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        last_frame = Instant::now();
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        return Ok(stable_or_early(subscribed_at, close_is_auth_rejection(frame)?));
                    }
                    Some(Ok(_)) => {
                        last_frame = Instant::now();
                    }
                    Some(Err(e)) => return Err(Error::Io(e.to_string())),
                    None => return Ok(stable_or_early(subscribed_at, Ok(()))),
                }
            }
        }

        if last_frame.elapsed() >= IDLE_PING_AFTER {
            if last_frame.elapsed() >= IDLE_PING_AFTER + IDLE_DISCONNECT_AFTER {
                return Err(Error::IdleTimeout { idle_secs: last_frame.elapsed().as_secs() });
            }
            let _ = send(&mut write, &ClientMessage::Ping).await;
        }
    }
}

fn stable_or_early(subscribed_at: Instant, result: Result<(), Error>) -> ConnectOutcome {
    let _ = result;
    if subscribed_at.elapsed() >= STABILITY_WINDOW {
        ConnectOutcome::StableDisconnect
    } else {
        ConnectOutcome::EarlyDisconnect
    }
}

fn close_is_auth_rejection(
    frame: Option<tungstenite::protocol::CloseFrame>,
) -> Result<(), Error> {
    if let Some(cf) = frame {
        tracing::info!(code = %cf.code, reason = %cf.reason, "close frame received");
        if u16::from(cf.code) == 4401 {
            return Err(Error::AuthRejected { code: 4401 });
        }
    }
    Ok(())
}

/// Returns `Some(outcome)` when the caller should return from the
/// connection loop (a `complete` frame), `None` to keep reading.
async fn handle_text_frame(
    text: &str,
    raw_tx: &mpsc::Sender<RawMessage>,
    subscription_id: &str,
    write: &mut (impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin),
    subscribed_at: Instant,
) -> Result<Option<ConnectOutcome>, Error> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring frame that doesn't match graphql-transport-ws shape");
            return Ok(None);
        }
    };

    match msg {
        ServerMessage::Next { payload, .. } => {
            let data = payload.get("data").cloned().unwrap_or(payload);
            let bytes = serde_json::to_vec(&data).unwrap_or_default();
            deliver(raw_tx, RawPayload::Data(bytes), subscription_id).await;
        }
        ServerMessage::Error { payload, .. } => {
            let message = payload.to_string();
            deliver(raw_tx, RawPayload::ServerError(message), subscription_id).await;
        }
        ServerMessage::Complete { .. } => {
            tracing::info!(subscription_id, "server sent complete, reconnecting");
            return Ok(Some(stable_or_early(subscribed_at, Ok(()))));
        }
        ServerMessage::Ping => {
            let _ = write.send(tungstenite::Message::Text(
                serde_json::to_string(&ClientMessage::Pong).unwrap_or_default().into(),
            )).await;
        }
        ServerMessage::Pong | ServerMessage::ConnectionAck => {}
    }
    Ok(None)
}

async fn deliver(raw_tx: &mpsc::Sender<RawMessage>, payload: RawPayload, subscription_id: &str) {
    let bytes = match payload {
        RawPayload::Data(b) => b,
        RawPayload::ServerError(msg) => format!("__server_error__:{msg}").into_bytes(),
    };
    // A full queue back-pressures the socket read loop, per spec §5: the
    // connection task simply stops reading the next frame until there's room.
    if raw_tx.send(RawMessage::new(bytes, subscription_id)).await.is_err() {
        tracing::warn!("pipeline receiver dropped, discarding in-flight message");
    }
}

async fn send(
    write: &mut (impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin),
    msg: &ClientMessage,
) -> Result<(), Error> {
    let text = serde_json::to_string(msg).map_err(|e| Error::Protocol(e.to_string()))?;
    write
        .send(tungstenite::Message::Text(text.into()))
        .await
        .map_err(|e| Error::Io(e.to_string()))
}

async fn wait_for_ack(
    read: &mut (impl StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin),
) -> Result<(), Error> {
    loop {
        match read.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::ConnectionAck) => return Ok(()),
                    _ => continue,
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(Error::Io(e.to_string())),
            None => return Err(Error::Protocol("connection closed before connection_ack".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_payload_server_error_is_tagged() {
        let bytes = b"__server_error__:boom".to_vec();
        assert!(String::from_utf8(bytes).unwrap().starts_with("__server_error__:"));
    }

    #[test]
    fn connection_state_transitions_are_distinct() {
        let states = [
            ConnectionState::Idle,
            ConnectionState::Dialing,
            ConnectionState::Authenticating,
            ConnectionState::Subscribed,
            ConnectionState::Draining,
            ConnectionState::Backoff,
        ];
        for (i, a) in states.iter().enumerate() {
            for (j, b) in states.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
