//! Wire types for the `graphql-transport-ws` sub-protocol.
//!
//! Internally tagged on `"type"`, `snake_case` variant names -- the same
//! shape the `juniper_graphql_transport_ws` server-side message enum uses,
//! mirrored here for the client side of the handshake.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the client sends to the server.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit { payload: Value },
    Subscribe { id: String, payload: SubscribePayload },
    Ping,
    Pong,
    Complete { id: String },
}

/// `subscribe` payload: a GraphQL document with no variables needed for the
/// device-state-change subscription.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscribePayload {
    pub query: String,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    Next { id: String, payload: Value },
    Error { id: String, payload: Value },
    Complete { id: String },
    Ping,
    Pong,
}

/// The device-state-change subscription document sent on `subscribe`.
pub const DEVICE_STATE_CHANGE_QUERY: &str = "subscription DeviceStateChanges { \
    deviceStateChanged { device { id label } currentState previousState \
    timestamp latitude longitude altitudeM rtkEnabled tags { key value } } }";
