//! In-memory per-session state (spec §3 `SessionState`).

use std::collections::HashMap;
use std::time::Instant;

use crate::model::DeviceState;

const STABILITY_WINDOW_SECS: u64 = 60;

/// State that lives for exactly one connected subscription session and is
/// cleared on disconnect. Owned and mutated only by the normalizer, which
/// must be called serially per session (spec §4.2).
#[derive(Debug)]
pub struct SessionState {
    pub subscription_id: String,
    last_state_by_device: HashMap<String, DeviceState>,
    connected_at: Instant,
    pub reconnect_attempt: u32,
}

impl SessionState {
    #[must_use]
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self::with_reconnect_attempt(subscription_id, 0)
    }

    /// Constructs a session seeded with the reconnect attempt count the
    /// transport reported when this subscription was established -- the
    /// pipeline reads this off `polaris-api`'s connection status watch
    /// whenever a new `subscription_id` appears on the raw stream.
    #[must_use]
    pub fn with_reconnect_attempt(subscription_id: impl Into<String>, reconnect_attempt: u32) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            last_state_by_device: HashMap::new(),
            connected_at: Instant::now(),
            reconnect_attempt,
        }
    }

    /// Returns the device's previously-seen state and records `new_state`
    /// as the latest, in one step -- avoids a caller forgetting to update
    /// after reading.
    pub fn advance(&mut self, device_id: &str, new_state: DeviceState) -> Option<DeviceState> {
        self.last_state_by_device.insert(device_id.to_string(), new_state)
    }

    /// Whether this session has been alive long enough that a subsequent
    /// disconnect should reset the reconnect attempt counter to zero.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.connected_at.elapsed().as_secs() >= STABILITY_WINDOW_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_returns_prior_state_and_updates_mapping() {
        let mut session = SessionState::new("sub-1");
        assert_eq!(session.advance("d1", DeviceState::Connected), None);
        assert_eq!(session.advance("d1", DeviceState::Disconnected), Some(DeviceState::Connected));
        assert_eq!(session.advance("d1", DeviceState::Connected), Some(DeviceState::Disconnected));
    }

    #[test]
    fn fresh_session_is_not_stable() {
        let session = SessionState::new("sub-1");
        assert!(!session.is_stable());
    }

    #[test]
    fn with_reconnect_attempt_seeds_the_counter() {
        let session = SessionState::with_reconnect_attempt("sub-2", 4);
        assert_eq!(session.reconnect_attempt, 4);
    }

    #[test]
    fn new_starts_the_counter_at_zero() {
        let session = SessionState::new("sub-1");
        assert_eq!(session.reconnect_attempt, 0);
    }
}
