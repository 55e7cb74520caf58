use serde::{Deserialize, Serialize};

use crate::failure::Failure;
use crate::payload::Payload;

/// Marker names understood by the replay core. Anything else recorded under
/// `MarkerRecorded` passes through untouched.
pub const SIDE_EFFECT_MARKER_NAME: &str = "SideEffect";
pub const MUTABLE_SIDE_EFFECT_MARKER_NAME: &str = "MutableSideEffect";
pub const VERSION_MARKER_NAME: &str = "Version";
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "LocalActivity";

/// Header embedded in mutable-side-effect and version markers.
///
/// `access_count` distinguishes the 3rd from the 7th invocation of the same
/// id during replay; `event_id` pins the marker to the history position the
/// recording call reserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableMarkerHeader {
    pub id: String,
    pub event_id: i64,
    pub access_count: u32,
}

/// Client-side decision recorded into history so replays reproduce it.
///
/// One shape serves all marker kinds; `name` selects the interpretation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerData {
    pub name: String,
    /// Raw recorded payload. For version markers this is the encoded version
    /// integer; for local activities the encoded [`LocalActivityMarkerData`].
    pub details: Option<Payload>,
    pub header: Option<MutableMarkerHeader>,
    pub failure: Option<Failure>,
}

impl MarkerData {
    pub fn new(name: impl Into<String>, details: Option<Payload>) -> Self {
        Self {
            name: name.into(),
            details,
            header: None,
            failure: None,
        }
    }

    pub fn with_header(mut self, header: MutableMarkerHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Contents of a local-activity result marker.
///
/// Local activities bypass the server task queue, so their results ride in
/// markers rather than activity events. Replay matches them by
/// `activity_id`, never by event id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalActivityMarkerData {
    pub activity_id: String,
    pub activity_type: String,
    /// 1-based attempt this marker records.
    pub attempt: u32,
    /// Residual retry backoff that did not fit in the workflow task budget.
    /// `Some` means the next attempt belongs to a later workflow task.
    pub backoff_ms: Option<i64>,
    /// Wall clock observed when the attempt resolved; advances the replay
    /// clock the same way a fired timer does.
    pub replay_time_ms: i64,
    pub result: Option<Payload>,
    pub failure: Option<Failure>,
}

impl LocalActivityMarkerData {
    /// Terminal markers resolve the local activity; non-terminal ones carry
    /// a residual backoff and schedule a retry on a later task.
    pub fn is_terminal(&self) -> bool {
        self.backoff_ms.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_header_and_failure() {
        let m = MarkerData::new(VERSION_MARKER_NAME, None)
            .with_header(MutableMarkerHeader {
                id: "change".into(),
                event_id: 5,
                access_count: 1,
            })
            .with_failure(Failure::application("x"));
        assert_eq!(m.header.as_ref().unwrap().event_id, 5);
        assert!(m.failure.is_some());
    }

    #[test]
    fn backoff_marks_non_terminal() {
        let data = LocalActivityMarkerData {
            activity_id: "1".into(),
            activity_type: "Echo".into(),
            attempt: 2,
            backoff_ms: Some(4_000),
            replay_time_ms: 0,
            result: None,
            failure: Some(Failure::application("attempt failed")),
        };
        assert!(!data.is_terminal());
    }
}
