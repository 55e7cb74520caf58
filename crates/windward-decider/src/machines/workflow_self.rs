//! Machine for the workflow's own terminal command.
//!
//! Complete, fail, cancel, and continue-as-new all share it; the command
//! kind is validated against the terminal record during matching.

use windward_types::event::{EventAttributes, HistoryEvent};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;

pub(crate) struct WorkflowSelfMachine;

pub(crate) fn on_event(
    _m: &mut WorkflowSelfMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    match (&event.attributes, state) {
        (
            EventAttributes::WorkflowCompleted { .. }
            | EventAttributes::WorkflowFailed { .. }
            | EventAttributes::WorkflowCanceled { .. }
            | EventAttributes::WorkflowContinuedAsNew { .. },
            MachineState::CommandSent,
        ) => Ok((MachineState::Completed, vec![])),
        _ => Err(unexpected("WorkflowSelf", state, event)),
    }
}
