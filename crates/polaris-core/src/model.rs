//! Record types written to NDJSON output (spec §3).
//!
//! `Record` is a closed tagged sum rather than a duck-typed map: the
//! normalizer either produces a fully-typed `StateChangeRecord` or a
//! `MalformedRecord`, never a partially-populated hybrid.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// The closed set of device states the wire protocol can report.
///
/// `Unknown` preserves the raw server string for diagnostics while still
/// letting the filter and writer treat state as a closed type everywhere
/// else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Connected,
    Disconnected,
    Connecting,
    Reconnecting,
    Error,
    Undefined,
    Unknown(String),
}

impl DeviceState {
    /// Parses the case-sensitive wire representation (spec §4.2 step 4).
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CONNECTED" => Self::Connected,
            "DISCONNECTED" => Self::Disconnected,
            "CONNECTING" => Self::Connecting,
            "RECONNECTING" => Self::Reconnecting,
            "ERROR" => Self::Error,
            "UNDEFINED" => Self::Undefined,
            other => Self::Unknown(other.to_string()),
        }
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Canonical wire string, used both for serialization and for filter
    /// list matching (`drop_states` is expressed in these strings).
    #[must_use]
    pub fn as_wire_str(&self) -> &str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
            Self::Undefined => "UNDEFINED",
            Self::Unknown(raw) => raw,
        }
    }
}

impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire_str())
    }
}

/// One `{key, value}` tag pair, order preserved from the server.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// `source.*` fields shared by both record kinds.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Source {
    pub instance_id: String,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChangeRecord {
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub device_id: String,
    pub device_label: Option<String>,
    pub previous_state: Option<DeviceState>,
    pub current_state: DeviceState,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    pub rtk_enabled: Option<bool>,
    pub tags: Vec<Tag>,
    pub source: Source,
}

/// Typed diagnostic codes for records the normalizer could not turn into a
/// clean state change (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedCode {
    ParseError,
    SchemaMismatch,
    MissingFields,
    UnknownState,
}

impl MalformedCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "parse_error",
            Self::SchemaMismatch => "schema_mismatch",
            Self::MissingFields => "missing_fields",
            Self::UnknownState => "unknown_state",
        }
    }
}

impl Serialize for MalformedCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

const RAW_PAYLOAD_LIMIT: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct MalformedError {
    pub code: MalformedCode,
    pub message: String,
    pub raw_payload: String,
    pub raw_payload_truncated: bool,
}

impl MalformedError {
    /// Builds the error block, truncating `raw` to `RAW_PAYLOAD_LIMIT` bytes
    /// at a UTF-8 char boundary and repairing any now-invalid tail.
    #[must_use]
    pub fn new(code: MalformedCode, message: impl Into<String>, raw: &[u8]) -> Self {
        let truncated = raw.len() > RAW_PAYLOAD_LIMIT;
        let slice = if truncated { &raw[..RAW_PAYLOAD_LIMIT] } else { raw };
        let raw_payload = String::from_utf8_lossy(slice).into_owned();
        Self { code, message: message.into(), raw_payload, raw_payload_truncated: truncated }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MalformedRecord {
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub error: MalformedError,
    pub source: Source,
}

/// One line of NDJSON output.
///
/// Serialized by hand (rather than via `#[serde(tag = "event_type")]`) so
/// `event_type` sits as a flat sibling of the variant's own fields, matching
/// the flat attribute table in spec §3 rather than an externally-tagged
/// `{"StateChange": {...}}` wrapper.
#[derive(Debug, Clone)]
pub enum Record {
    StateChange(StateChangeRecord),
    Malformed(MalformedRecord),
}

impl Record {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateChange(_) => "state_change",
            Self::Malformed(_) => "malformed",
        }
    }

    #[must_use]
    pub fn current_state(&self) -> Option<&DeviceState> {
        match self {
            Self::StateChange(r) => Some(&r.current_state),
            Self::Malformed(_) => None,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::StateChange(r) => Some(&r.device_id),
            Self::Malformed(_) => None,
        }
    }

    /// One line of NDJSON: the serialized JSON object with `event_type`
    /// flattened in, no trailing newline.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut value = match self {
            Self::StateChange(r) => serde_json::to_value(r)?,
            Self::Malformed(r) => serde_json::to_value(r)?,
        };
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert("event_type".into(), serde_json::Value::String(self.event_type().into()));
        }
        serde_json::to_string(&value)
    }
}
