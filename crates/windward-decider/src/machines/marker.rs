//! Marker and search-attribute machines: fire-and-forget commands whose
//! record is their own completion.

use windward_types::event::{EventAttributes, HistoryEvent};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;

pub(crate) struct MarkerMachine {
    pub(crate) marker_name: String,
}

pub(crate) fn on_event(
    m: &mut MarkerMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    match (&event.attributes, state) {
        (EventAttributes::MarkerRecorded(data), MachineState::CommandSent)
            if data.name == m.marker_name =>
        {
            Ok((MachineState::Completed, vec![]))
        }
        _ => Err(unexpected("Marker", state, event)),
    }
}

pub(crate) struct SearchAttributesMachine;

pub(crate) fn search_attributes_on_event(
    _m: &mut SearchAttributesMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    match (&event.attributes, state) {
        (EventAttributes::UpsertSearchAttributes { .. }, MachineState::CommandSent) => {
            Ok((MachineState::Completed, vec![]))
        }
        _ => Err(unexpected("SearchAttributes", state, event)),
    }
}
