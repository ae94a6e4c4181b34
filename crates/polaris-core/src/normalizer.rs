//! Event Normalizer (spec §4.2): pure-ish function from a raw frame to
//! exactly one [`Record`], threading [`SessionState`] for `previous_state`.

use polaris_api::RawMessage;
use serde_json::Value;

use crate::model::{
    DeviceState, MalformedCode, MalformedError, MalformedRecord, Record, Source,
    StateChangeRecord, Tag,
};
use crate::session::SessionState;

const SERVER_ERROR_MARKER: &str = "__server_error__:";

/// Maps one inbound frame to one record, updating `session` in the process.
///
/// Must be called serially per session: `SessionState.last_state_by_device`
/// is not safe for concurrent mutation (spec §4.2, §5).
pub fn normalize(raw: &RawMessage, instance_id: &str, session: &mut SessionState) -> Record {
    let source = Source {
        instance_id: instance_id.to_string(),
        subscription_id: session.subscription_id.clone(),
    };

    if let Ok(text) = std::str::from_utf8(&raw.bytes) {
        if let Some(message) = text.strip_prefix(SERVER_ERROR_MARKER) {
            return malformed(MalformedCode::ParseError, message, &raw.bytes, raw, source);
        }
    }

    let value: Value = match serde_json::from_slice(&raw.bytes) {
        Ok(v) => v,
        Err(e) => return malformed(MalformedCode::ParseError, e.to_string(), &raw.bytes, raw, source),
    };

    let device_changed = match walk_to_device_state_changed(&value) {
        Some(node) => node,
        None => {
            return malformed(
                MalformedCode::SchemaMismatch,
                "payload does not contain deviceStateChanged".to_string(),
                &raw.bytes,
                raw,
                source,
            )
        }
    };

    let device_id = device_changed
        .get("device")
        .and_then(|d| d.get("id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let current_state_raw = device_changed.get("currentState").and_then(Value::as_str);

    let (device_id, current_state_raw) = match (device_id, current_state_raw) {
        (Some(id), Some(state)) => (id, state),
        _ => {
            return malformed(
                MalformedCode::MissingFields,
                "missing device.id or currentState".to_string(),
                &raw.bytes,
                raw,
                source,
            )
        }
    };

    let current_state = DeviceState::parse(current_state_raw);
    if !current_state.is_known() {
        return malformed(
            MalformedCode::UnknownState,
            current_state_raw.to_string(),
            &raw.bytes,
            raw,
            source,
        );
    }

    let previous_state = session.advance(device_id, current_state.clone());

    let device_label = device_changed
        .get("device")
        .and_then(|d| d.get("label"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let timestamp = device_changed
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    let tags = device_changed
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let key = t.get("key").and_then(Value::as_str)?.to_string();
                    let value = t.get("value").and_then(Value::as_str)?.to_string();
                    Some(Tag { key, value })
                })
                .collect()
        })
        .unwrap_or_default();

    Record::StateChange(StateChangeRecord {
        timestamp,
        received_at: raw.received_at,
        device_id: device_id.to_string(),
        device_label,
        previous_state,
        current_state,
        latitude: device_changed.get("latitude").and_then(Value::as_f64),
        longitude: device_changed.get("longitude").and_then(Value::as_f64),
        altitude_m: device_changed.get("altitudeM").and_then(Value::as_f64),
        rtk_enabled: device_changed.get("rtkEnabled").and_then(Value::as_bool),
        tags,
        source,
    })
}

/// Accepts either the bare `deviceStateChanged` object (already unwrapped
/// by the transport) or a full GraphQL `{"deviceStateChanged": {...}}`
/// envelope, since `polaris-api` forwards `payload.data` as-is.
fn walk_to_device_state_changed(value: &Value) -> Option<&Value> {
    if let Some(node) = value.get("deviceStateChanged") {
        return Some(node);
    }
    if value.get("device").is_some() && value.get("currentState").is_some() {
        return Some(value);
    }
    None
}

fn malformed(
    code: MalformedCode,
    message: String,
    raw_bytes: &[u8],
    raw: &RawMessage,
    source: Source,
) -> Record {
    Record::Malformed(MalformedRecord {
        timestamp: raw.received_at,
        received_at: raw.received_at,
        error: MalformedError::new(code, message, raw_bytes),
        source,
    })
}
