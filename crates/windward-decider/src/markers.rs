//! Marker bookkeeping: side effects, mutable side effects, and versions.
//!
//! Three marker kinds share the `MarkerRecorded` record and one handler.
//! Side effects are keyed by the event id their recording call reserved;
//! mutable side effects and versions are keyed by user id with an access
//! count embedded in the marker header, which is how replay tells the 3rd
//! invocation of an id from the 7th. The decider owns the positional peek
//! into history; this module owns the accumulated state and the
//! extraction/construction of marker payloads.

use std::collections::HashMap;

use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::marker::{
    LOCAL_ACTIVITY_MARKER_NAME, LocalActivityMarkerData, MUTABLE_SIDE_EFFECT_MARKER_NAME,
    MarkerData, MutableMarkerHeader, SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};
use windward_types::Payload;

#[derive(Default)]
struct MutableEntry {
    value: Option<Payload>,
    access_count: u32,
}

/// Accumulated marker state for one run.
#[derive(Default)]
pub(crate) struct MarkerHandler {
    /// Side-effect payloads recorded in history, keyed by their event id.
    side_effects: HashMap<i64, Payload>,
    /// Last stored value and call count per mutable-side-effect id.
    mutable: HashMap<String, MutableEntry>,
    /// Recorded version per change id.
    versions: HashMap<String, i32>,
    /// Call count per change id, mirroring the mutable access counts.
    version_access: HashMap<String, u32>,
}

impl MarkerHandler {
    /// Pre-cache pass over a slice's command records; side-effect values
    /// must be available before the event loop replays the calls that
    /// consume them.
    pub(crate) fn cache_marker(&mut self, event: &HistoryEvent) {
        if let EventAttributes::MarkerRecorded(data) = &event.attributes {
            if data.name == SIDE_EFFECT_MARKER_NAME {
                if let Some(payload) = &data.details {
                    self.side_effects.insert(event.event_id, payload.clone());
                }
            }
        }
    }

    pub(crate) fn side_effect(&self, event_id: i64) -> Option<&Payload> {
        self.side_effects.get(&event_id)
    }

    pub(crate) fn record_side_effect(&mut self, event_id: i64, value: Payload) {
        self.side_effects.insert(event_id, value);
    }

    /// Count the call and return the new per-id access count.
    pub(crate) fn bump_mutable_access(&mut self, id: &str) -> u32 {
        let entry = self.mutable.entry(id.to_string()).or_default();
        entry.access_count += 1;
        entry.access_count
    }

    pub(crate) fn stored_mutable(&self, id: &str) -> Option<&Payload> {
        self.mutable.get(id).and_then(|e| e.value.as_ref())
    }

    pub(crate) fn store_mutable(&mut self, id: &str, value: Payload) {
        self.mutable.entry(id.to_string()).or_default().value = Some(value);
    }

    pub(crate) fn bump_version_access(&mut self, change_id: &str) -> u32 {
        let count = self.version_access.entry(change_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn version(&self, change_id: &str) -> Option<i32> {
        self.versions.get(change_id).copied()
    }

    pub(crate) fn set_version(&mut self, change_id: &str, version: i32) {
        self.versions.insert(change_id.to_string(), version);
    }
}

/// `(change_id, version, access_count)` when the event is a version marker.
pub(crate) fn as_version_marker(event: &HistoryEvent) -> Option<(&str, i32, u32)> {
    let EventAttributes::MarkerRecorded(data) = &event.attributes else {
        return None;
    };
    if data.name != VERSION_MARKER_NAME {
        return None;
    }
    let header = data.header.as_ref()?;
    let version = data.details.as_ref()?.decode_json::<i32>().ok()?;
    Some((header.id.as_str(), version, header.access_count))
}

/// `(id, value, access_count)` when the event is a mutable-side-effect
/// marker.
pub(crate) fn as_mutable_marker(event: &HistoryEvent) -> Option<(&str, &Payload, u32)> {
    let EventAttributes::MarkerRecorded(data) = &event.attributes else {
        return None;
    };
    if data.name != MUTABLE_SIDE_EFFECT_MARKER_NAME {
        return None;
    }
    let header = data.header.as_ref()?;
    let value = data.details.as_ref()?;
    Some((header.id.as_str(), value, header.access_count))
}

/// Decoded local-activity marker contents, when the event is one.
pub(crate) fn as_local_activity_marker(event: &HistoryEvent) -> Option<LocalActivityMarkerData> {
    let EventAttributes::MarkerRecorded(data) = &event.attributes else {
        return None;
    };
    if data.name != LOCAL_ACTIVITY_MARKER_NAME {
        return None;
    }
    data.details.as_ref()?.decode_json().ok()
}

pub(crate) fn side_effect_marker(value: Payload) -> MarkerData {
    MarkerData::new(SIDE_EFFECT_MARKER_NAME, Some(value))
}

pub(crate) fn mutable_marker(id: &str, event_id: i64, access_count: u32, value: Payload) -> MarkerData {
    MarkerData::new(MUTABLE_SIDE_EFFECT_MARKER_NAME, Some(value)).with_header(MutableMarkerHeader {
        id: id.to_string(),
        event_id,
        access_count,
    })
}

pub(crate) fn version_marker(
    change_id: &str,
    event_id: i64,
    access_count: u32,
    version: i32,
) -> MarkerData {
    MarkerData::new(
        VERSION_MARKER_NAME,
        Payload::json(&version).ok(),
    )
    .with_header(MutableMarkerHeader {
        id: change_id.to_string(),
        event_id,
        access_count,
    })
}

pub(crate) fn local_activity_marker(data: &LocalActivityMarkerData) -> MarkerData {
    let mut marker = MarkerData::new(LOCAL_ACTIVITY_MARKER_NAME, Payload::json(data).ok());
    if let Some(failure) = &data.failure {
        marker = marker.with_failure(failure.clone());
    }
    marker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHistoryBuilder;

    #[test]
    fn side_effect_cache_is_positional() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        let id = t.add_side_effect_marker(Payload::json(&42u32).unwrap());

        let mut handler = MarkerHandler::default();
        for e in t.events() {
            handler.cache_marker(e);
        }
        assert_eq!(
            handler.side_effect(id).unwrap().decode_json::<u32>().unwrap(),
            42
        );
        assert!(handler.side_effect(id + 1).is_none());
    }

    #[test]
    fn access_counts_are_per_id() {
        let mut handler = MarkerHandler::default();
        assert_eq!(handler.bump_mutable_access("a"), 1);
        assert_eq!(handler.bump_mutable_access("a"), 2);
        assert_eq!(handler.bump_mutable_access("b"), 1);
        assert_eq!(handler.bump_version_access("a"), 1);
    }

    #[test]
    fn version_marker_round_trips_through_extraction() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        let id = t.add_version_marker("change-a", 3, 1);

        let event = &t.events()[(id - 1) as usize];
        let (change_id, version, access) = as_version_marker(event).unwrap();
        assert_eq!(change_id, "change-a");
        assert_eq!(version, 3);
        assert_eq!(access, 1);
    }

    #[test]
    fn non_marker_events_extract_to_nothing() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        let event = &t.events()[0];
        assert!(as_version_marker(event).is_none());
        assert!(as_mutable_marker(event).is_none());
        assert!(as_local_activity_marker(event).is_none());
    }
}
