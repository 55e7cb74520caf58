//! Timer state machine.
//!
//! Timers are the one machine whose initiation record is also its start:
//! `TimerStarted` jumps straight to `Started`. Cancellation is immediate on
//! the workflow side; the machine keeps absorbing the late `TimerCanceled`
//! (or a racing `TimerFired`) without raising.

use windward_types::Command;
use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::Failure;

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;
use crate::futures::FutureHandle;

pub(crate) struct TimerMachine {
    pub(crate) seq: u32,
    pub(crate) timer_id: String,
    pub(crate) fire_handle: FutureHandle,
    pub(crate) started_event_id: Option<i64>,
}

pub(crate) fn on_event(
    m: &mut TimerMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    use MachineState::*;
    match (&event.attributes, state) {
        (EventAttributes::TimerStarted { .. }, CommandSent) => {
            m.started_event_id = Some(event.event_id);
            Ok((Started, vec![]))
        }
        // Start record for a timer already canceled locally; the cancel
        // command is right behind it.
        (EventAttributes::TimerStarted { .. }, CanceledAfterStarted) => {
            m.started_event_id = Some(event.event_id);
            Ok((CanceledAfterStarted, vec![]))
        }
        (EventAttributes::TimerFired { .. }, Started) => Ok((
            Completed,
            vec![
                MachineAction::AdvanceClock {
                    time_ms: event.timestamp.timestamp_millis(),
                },
                MachineAction::Resolve {
                    handle: m.fire_handle,
                    result: Ok(None),
                },
            ],
        )),
        // Cancel already resolved the future; these records are absorbed.
        (EventAttributes::TimerCanceled { .. }, CanceledAfterStarted) => Ok((Completed, vec![])),
        (EventAttributes::TimerFired { .. }, CanceledAfterStarted | Completed) => {
            Ok((Completed, vec![]))
        }
        _ => Err(unexpected("Timer", state, event)),
    }
}

pub(crate) struct TimerCancelOutcome {
    pub(crate) new_state: MachineState,
    pub(crate) command: Option<Command>,
}

/// Cancel a timer. The fire future resolves as canceled before this
/// returns to the workflow, regardless of what the server later records.
pub(crate) fn cancel(m: &mut TimerMachine, state: MachineState) -> TimerCancelOutcome {
    use MachineState::*;
    match state {
        Created => TimerCancelOutcome {
            new_state: CanceledBeforeInitiated,
            command: None,
        },
        CommandSent | Started => TimerCancelOutcome {
            new_state: CanceledAfterStarted,
            command: Some(Command::CancelTimer {
                timer_id: m.timer_id.clone(),
            }),
        },
        other => TimerCancelOutcome {
            new_state: other,
            command: None,
        },
    }
}

/// The cancellation failure surfaced to the awaiting coroutine.
pub(crate) fn canceled_failure(m: &TimerMachine) -> Failure {
    Failure::canceled(format!("timer {} canceled", m.timer_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn machine() -> TimerMachine {
        TimerMachine {
            seq: 0,
            timer_id: "0".into(),
            fire_handle: 0,
            started_event_id: None,
        }
    }

    fn event(event_id: i64, ms: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id,
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
            attributes,
        }
    }

    #[test]
    fn initiation_is_start() {
        let mut m = machine();
        let started = event(
            5,
            0,
            EventAttributes::TimerStarted {
                timer_id: "0".into(),
                start_to_fire_timeout_ms: 10_000,
            },
        );
        let (state, actions) = on_event(&mut m, MachineState::CommandSent, &started).unwrap();
        assert_eq!(state, MachineState::Started);
        assert!(actions.is_empty());
    }

    #[test]
    fn firing_advances_the_clock_then_resolves() {
        let mut m = machine();
        let fired = event(
            9,
            42_000,
            EventAttributes::TimerFired {
                started_event_id: 5,
                timer_id: "0".into(),
            },
        );
        let (state, actions) = on_event(&mut m, MachineState::Started, &fired).unwrap();
        assert_eq!(state, MachineState::Completed);
        assert!(matches!(
            actions.as_slice(),
            [
                MachineAction::AdvanceClock { time_ms: 42_000 },
                MachineAction::Resolve { result: Ok(None), .. }
            ]
        ));
    }

    #[test]
    fn late_cancel_and_fire_records_are_absorbed() {
        let mut m = machine();
        let outcome = cancel(&mut m, MachineState::Started);
        assert_eq!(outcome.new_state, MachineState::CanceledAfterStarted);
        assert!(matches!(outcome.command, Some(Command::CancelTimer { .. })));

        let canceled = event(
            9,
            0,
            EventAttributes::TimerCanceled {
                started_event_id: 5,
                timer_id: "0".into(),
            },
        );
        let (state, actions) = on_event(&mut m, outcome.new_state, &canceled).unwrap();
        assert_eq!(state, MachineState::Completed);
        assert!(actions.is_empty());

        let mut m2 = machine();
        let fired = event(
            9,
            0,
            EventAttributes::TimerFired {
                started_event_id: 5,
                timer_id: "0".into(),
            },
        );
        let (state, actions) =
            on_event(&mut m2, MachineState::CanceledAfterStarted, &fired).unwrap();
        assert_eq!(state, MachineState::Completed);
        assert!(actions.is_empty());
    }
}
