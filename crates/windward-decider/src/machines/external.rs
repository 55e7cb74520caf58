//! Machines for signalling and cancelling other workflow executions.
//!
//! A signal canceled before its command is flushed collapses to
//! `Completed` with no network effect; once flushed, cancel is a no-op and
//! the machine waits for the server's verdict. Cancel-external machines
//! additionally carry an optional link to a child-workflow machine whose
//! cancellation they are transporting.

use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::{Failure, FailureKind, WorkflowExecution};

use super::{MachineAction, MachineKey, MachineState, unexpected};
use crate::error::DeciderError;
use crate::futures::FutureHandle;

pub(crate) struct SignalExternalMachine {
    pub(crate) seq: u32,
    pub(crate) execution: WorkflowExecution,
    pub(crate) signal_name: String,
    pub(crate) handle: FutureHandle,
}

pub(crate) fn signal_on_event(
    m: &mut SignalExternalMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    use MachineState::*;
    match (&event.attributes, state) {
        (EventAttributes::SignalExternalInitiated { .. }, CommandSent) => Ok((Initiated, vec![])),
        (EventAttributes::ExternalSignaled { .. }, Initiated) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.handle,
                result: Ok(None),
            }],
        )),
        (EventAttributes::SignalExternalFailed { cause, .. }, Initiated) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.handle,
                result: Err(Failure::new(
                    FailureKind::SignalExternal,
                    format!(
                        "signal {} to {} failed: {cause}",
                        m.signal_name, m.execution
                    ),
                )),
            }],
        )),
        _ => Err(unexpected("SignalExternal", state, event)),
    }
}

/// Cancel a pending external signal. Only meaningful before the command is
/// flushed; afterwards the machine rides out the server's answer.
pub(crate) fn signal_cancel(
    m: &mut SignalExternalMachine,
    state: MachineState,
) -> (MachineState, Vec<MachineAction>) {
    match state {
        MachineState::Created => (
            MachineState::CanceledBeforeInitiated,
            vec![MachineAction::Resolve {
                handle: m.handle,
                result: Err(Failure::canceled(format!(
                    "signal {} canceled before sending",
                    m.signal_name
                ))),
            }],
        ),
        other => (other, vec![]),
    }
}

pub(crate) struct CancelExternalMachine {
    pub(crate) seq: u32,
    pub(crate) execution: WorkflowExecution,
    /// Absent when this machine transports a child-workflow cancellation
    /// rather than a direct `cancel_external` call.
    pub(crate) handle: Option<FutureHandle>,
    /// Child machine to poke when the server acknowledges the request.
    pub(crate) notify_child: Option<MachineKey>,
}

pub(crate) fn cancel_on_event(
    m: &mut CancelExternalMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    use MachineState::*;
    match (&event.attributes, state) {
        (EventAttributes::CancelExternalInitiated { .. }, CommandSent) => Ok((Initiated, vec![])),
        (EventAttributes::ExternalCancelRequested { .. }, Initiated) => {
            let mut actions = Vec::new();
            if let Some(handle) = m.handle {
                actions.push(MachineAction::Resolve {
                    handle,
                    result: Ok(None),
                });
            }
            if let Some(child) = m.notify_child {
                actions.push(MachineAction::NotifyChildCancelRequested { child });
            }
            Ok((Completed, actions))
        }
        (EventAttributes::CancelExternalFailed { cause, .. }, Initiated) => {
            let mut actions = Vec::new();
            if let Some(handle) = m.handle {
                actions.push(MachineAction::Resolve {
                    handle,
                    result: Err(Failure::new(
                        FailureKind::CancelExternal,
                        format!("cancel of {} failed: {cause}", m.execution),
                    )),
                });
            }
            Ok((Completed, actions))
        }
        _ => Err(unexpected("CancelExternal", state, event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn event(event_id: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            attributes,
        }
    }

    #[test]
    fn signal_cancel_before_flush_collapses_with_no_wire_effect() {
        let mut m = SignalExternalMachine {
            seq: 0,
            execution: WorkflowExecution::new("other", ""),
            signal_name: "ping".into(),
            handle: 0,
        };
        let (state, actions) = signal_cancel(&mut m, MachineState::Created);
        assert_eq!(state, MachineState::CanceledBeforeInitiated);
        assert!(matches!(
            &actions[0],
            MachineAction::Resolve { result: Err(f), .. } if f.is_canceled()
        ));

        // After the command went out, cancel does nothing.
        let (state, actions) = signal_cancel(&mut m, MachineState::Initiated);
        assert_eq!(state, MachineState::Initiated);
        assert!(actions.is_empty());
    }

    #[test]
    fn cancel_external_acknowledgement_notifies_the_linked_child() {
        let mut m = CancelExternalMachine {
            seq: 0,
            execution: WorkflowExecution::new("child-1", ""),
            handle: None,
            notify_child: Some(MachineKey(7)),
        };
        let initiated = event(
            5,
            EventAttributes::CancelExternalInitiated {
                execution: WorkflowExecution::new("child-1", ""),
            },
        );
        let (state, _) = cancel_on_event(&mut m, MachineState::CommandSent, &initiated).unwrap();
        let requested = event(6, EventAttributes::ExternalCancelRequested { initiated_event_id: 5 });
        let (state, actions) = cancel_on_event(&mut m, state, &requested).unwrap();
        assert_eq!(state, MachineState::Completed);
        assert!(matches!(
            actions.as_slice(),
            [MachineAction::NotifyChildCancelRequested { child: MachineKey(7) }]
        ));
    }
}
