//! GraphQL-over-WebSocket transport for the device-state-change subscription.
//!
//! This crate is a pure byte pump: it dials, authenticates, subscribes, and
//! hands the caller raw frame bytes plus reconnect/backoff policy. It never
//! parses device state or writes NDJSON -- that's `polaris-core`.

mod backoff;
mod connection;
mod error;
mod protocol;
mod raw;

pub use backoff::{JitterRng, ReconnectPolicy};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus, RawPayload};
pub use error::Error;
pub use protocol::{ClientMessage, ServerMessage, SubscribePayload, DEVICE_STATE_CHANGE_QUERY};
pub use raw::RawMessage;
