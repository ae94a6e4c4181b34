//! Transport-layer error type for the `polaris-api` crate.
//!
//! Covers dial failures, handshake/protocol violations, and WebSocket I/O.
//! `polaris-core` translates these into process-level log events; none of
//! them ever become a `malformed` record -- that classification belongs to
//! the normalizer, not the transport.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// TCP/TLS dial to the endpoint failed.
    #[error("failed to dial {url}: {reason}")]
    Dial { url: String, reason: String },

    /// `connection_ack` did not arrive within the configured timeout.
    #[error("connection_ack not received within {timeout_secs}s")]
    AckTimeout { timeout_secs: u64 },

    /// Server closed with an authentication-related close code.
    #[error("authentication rejected (close code {code})")]
    AuthRejected { code: u16 },

    /// The server sent a frame that doesn't fit the `graphql-transport-ws`
    /// message shape at all (not a JSON parse failure -- that's a protocol
    /// violation the connection manager treats as a transient error, not a
    /// record -- see `polaris-core::normalizer` for data-plane parsing).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Underlying WebSocket I/O error (reset, timeout, close without
    /// handshake, etc).
    #[error("websocket I/O error: {0}")]
    Io(String),

    /// No frame (including keepalive ping/pong) arrived within the
    /// configured idle window.
    #[error("no frame received for {idle_secs}s, treating connection as dead")]
    IdleTimeout { idle_secs: u64 },

    /// Invalid URL supplied for the endpoint.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
