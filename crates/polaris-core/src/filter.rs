//! Filter stage (spec §4.3): deterministic keep/drop policy on
//! already-normalized records.

use std::collections::HashSet;

use crate::model::Record;

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub drop_states: HashSet<String>,
    pub drop_device_ids: HashSet<String>,
    pub keep_device_ids: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Drop,
}

/// Evaluates the five-rule policy in spec §4.3, in order. Malformed
/// records always pass -- they are diagnostics, never subject to content
/// filtering.
#[must_use]
pub fn evaluate(record: &Record, config: &FilterConfig) -> FilterDecision {
    let Record::StateChange(state_change) = record else {
        return FilterDecision::Keep;
    };

    if config.drop_states.contains(state_change.current_state.as_wire_str()) {
        return FilterDecision::Drop;
    }
    if config.drop_device_ids.contains(&state_change.device_id) {
        return FilterDecision::Drop;
    }
    if !config.keep_device_ids.is_empty() && !config.keep_device_ids.contains(&state_change.device_id) {
        return FilterDecision::Drop;
    }
    FilterDecision::Keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceState, Source, StateChangeRecord};
    use chrono::Utc;

    fn state_change(device_id: &str, state: DeviceState) -> Record {
        Record::StateChange(StateChangeRecord {
            timestamp: Utc::now(),
            received_at: Utc::now(),
            device_id: device_id.to_string(),
            device_label: None,
            previous_state: None,
            current_state: state,
            latitude: None,
            longitude: None,
            altitude_m: None,
            rtk_enabled: None,
            tags: vec![],
            source: Source { instance_id: "writer-01".into(), subscription_id: "sub-1".into() },
        })
    }

    #[test]
    fn malformed_records_always_pass() {
        let record = Record::Malformed(crate::model::MalformedRecord {
            timestamp: Utc::now(),
            received_at: Utc::now(),
            error: crate::model::MalformedError::new(
                crate::model::MalformedCode::ParseError,
                "boom",
                b"x",
            ),
            source: Source { instance_id: "writer-01".into(), subscription_id: "sub-1".into() },
        });
        let config = FilterConfig { drop_states: ["irrelevant".into()].into(), ..Default::default() };
        assert_eq!(evaluate(&record, &config), FilterDecision::Keep);
    }

    #[test]
    fn drop_states_rule_wins_over_no_other_rule() {
        let config = FilterConfig { drop_states: ["UNDEFINED".into()].into(), ..Default::default() };
        assert_eq!(evaluate(&state_change("d1", DeviceState::Undefined), &config), FilterDecision::Drop);
        assert_eq!(evaluate(&state_change("d1", DeviceState::Connected), &config), FilterDecision::Keep);
    }

    #[test]
    fn drop_device_ids_rule() {
        let config = FilterConfig { drop_device_ids: ["bad-device".into()].into(), ..Default::default() };
        assert_eq!(evaluate(&state_change("bad-device", DeviceState::Connected), &config), FilterDecision::Drop);
    }

    #[test]
    fn keep_device_ids_excludes_everything_else() {
        let config = FilterConfig { keep_device_ids: ["allowed".into()].into(), ..Default::default() };
        assert_eq!(evaluate(&state_change("allowed", DeviceState::Connected), &config), FilterDecision::Keep);
        assert_eq!(evaluate(&state_change("other", DeviceState::Connected), &config), FilterDecision::Drop);
    }

    #[test]
    fn drop_wins_when_device_in_both_keep_and_drop_lists() {
        let config = FilterConfig {
            keep_device_ids: ["d1".into()].into(),
            drop_device_ids: ["d1".into()].into(),
            ..Default::default()
        };
        assert_eq!(evaluate(&state_change("d1", DeviceState::Connected), &config), FilterDecision::Drop);
    }
}
