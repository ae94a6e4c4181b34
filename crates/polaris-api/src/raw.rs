//! `RawMessage` -- an opaque payload handed downstream to the normalizer.

use chrono::{DateTime, Utc};

/// One inbound `next` frame's `payload.data`, tagged with receive time and
/// the session it arrived on.
///
/// Deliberately holds raw bytes rather than a parsed `serde_json::Value` --
/// parsing (and classifying parse failure) is the normalizer's job, not the
/// transport's. This keeps the connection manager a pure byte pump.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub subscription_id: String,
}

impl RawMessage {
    #[must_use]
    pub fn new(bytes: Vec<u8>, subscription_id: impl Into<String>) -> Self {
        Self {
            bytes,
            received_at: Utc::now(),
            subscription_id: subscription_id.into(),
        }
    }
}
