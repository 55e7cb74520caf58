//! Workflow-task machine: bookkeeping for the task lifecycle records.
//!
//! Its only observable output is the `TriggerTaskStarted` action that
//! advances the current started event id and the replay clock. Failed and
//! timed-out tasks never reach it; the history iterator discards them.

use windward_types::event::{EventAttributes, HistoryEvent};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;

pub(crate) struct WorkflowTaskMachine {
    pub(crate) scheduled_event_id: i64,
}

pub(crate) fn on_event(
    _m: &mut WorkflowTaskMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    match (&event.attributes, state) {
        (EventAttributes::WorkflowTaskStarted { .. }, MachineState::Initiated) => Ok((
            MachineState::Completed,
            vec![MachineAction::TriggerTaskStarted {
                started_event_id: event.event_id,
                time_ms: event.timestamp.timestamp_millis(),
            }],
        )),
        // A completion record can reach the machine on sticky pages that
        // re-deliver it; it carries nothing new.
        (EventAttributes::WorkflowTaskCompleted { .. }, MachineState::Completed) => {
            Ok((MachineState::Completed, vec![]))
        }
        _ => Err(unexpected("WorkflowTask", state, event)),
    }
}

impl WorkflowTaskMachine {
    pub(crate) fn new(scheduled_event_id: i64) -> Self {
        Self { scheduled_event_id }
    }
}
