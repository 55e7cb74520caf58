//! Local-activity machine.
//!
//! Local activities never produce activity events; their outcome rides in
//! a `LocalActivity` marker. During replay those markers do not line up
//! with a buffered command the way other records do, so the decider keys
//! these machines by activity id in a side map and either consumes the
//! marker there or lets it match the echo command recorded at resolution
//! time.

use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::marker::LOCAL_ACTIVITY_MARKER_NAME;
use windward_types::{LocalActivityOptions, Payload};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;
use crate::futures::FutureHandle;

pub(crate) struct LocalActivityMachine {
    pub(crate) seq: u32,
    pub(crate) activity_id: String,
    pub(crate) activity_type: String,
    pub(crate) input: Option<Payload>,
    pub(crate) options: LocalActivityOptions,
    pub(crate) result_handle: FutureHandle,
}

pub(crate) fn on_event(
    m: &mut LocalActivityMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    match (&event.attributes, state) {
        // The echo marker command recorded when the activity resolved.
        (EventAttributes::MarkerRecorded(data), MachineState::CommandSent | MachineState::Created)
            if data.name == LOCAL_ACTIVITY_MARKER_NAME =>
        {
            Ok((MachineState::Completed, vec![]))
        }
        _ => Err(unexpected("LocalActivity", state, event)),
    }
}

impl LocalActivityMachine {
    pub(crate) fn describe(&self) -> String {
        format!("local activity {} ({})", self.activity_id, self.activity_type)
    }
}
