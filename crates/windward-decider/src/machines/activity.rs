//! Activity state machine: the canonical full lifecycle.

use windward_types::event::EventAttributes;
use windward_types::event::HistoryEvent;
use windward_types::{ActivityCancellationType, Command, Failure, FailureKind};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;
use crate::futures::FutureHandle;

pub(crate) struct ActivityMachine {
    pub(crate) seq: u32,
    pub(crate) activity_id: String,
    pub(crate) activity_type: String,
    pub(crate) cancellation_type: ActivityCancellationType,
    pub(crate) result_handle: FutureHandle,
    pub(crate) scheduled_event_id: Option<i64>,
    /// Cancel was requested with `Abandon`: the machine stays subscribed to
    /// events but resolves nothing further.
    pub(crate) abandoned: bool,
}

fn wrap_activity_failure(activity_type: &str, cause: Failure) -> Failure {
    Failure::new(
        FailureKind::Activity,
        format!("activity {activity_type} failed"),
    )
    .caused_by(cause)
}

pub(crate) fn on_event(
    m: &mut ActivityMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    use MachineState::*;
    match (&event.attributes, state) {
        (EventAttributes::ActivityScheduled { .. }, CommandSent) => {
            m.scheduled_event_id = Some(event.event_id);
            Ok((Initiated, vec![]))
        }
        // Command was withdrawn after flushing; now that the server has
        // recorded it anyway, chase it with a cancel request.
        (EventAttributes::ActivityScheduled { .. }, CanceledBeforeInitiated) => {
            m.scheduled_event_id = Some(event.event_id);
            Ok((
                CanceledAfterInitiated,
                vec![MachineAction::IssueCommand {
                    command: Command::RequestCancelActivity {
                        activity_id: m.activity_id.clone(),
                    },
                }],
            ))
        }
        (EventAttributes::ActivityStarted { .. }, Initiated) => Ok((Started, vec![])),
        (EventAttributes::ActivityStarted { .. }, CanceledAfterInitiated) => {
            Ok((CanceledAfterStarted, vec![]))
        }
        (
            EventAttributes::ActivityCompleted { result, .. },
            Initiated | Started,
        ) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Ok(result.clone()),
            }],
        )),
        (EventAttributes::ActivityFailed { failure, .. }, Initiated | Started) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(wrap_activity_failure(&m.activity_type, failure.clone())),
            }],
        )),
        (EventAttributes::ActivityTimedOut { timeout_kind, .. }, Initiated | Started) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(wrap_activity_failure(
                    &m.activity_type,
                    Failure::timeout(*timeout_kind),
                )),
            }],
        )),
        // The record of our own RequestCancelActivity command.
        (
            EventAttributes::ActivityCancelRequested { .. },
            CanceledAfterInitiated | CanceledAfterStarted,
        ) => Ok((CancellationCommandSent, vec![])),
        (
            EventAttributes::ActivityCanceled { .. },
            CancellationCommandSent | CanceledAfterInitiated | CanceledAfterStarted,
        ) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                // No-op unless the workflow opted into waiting for this.
                result: Err(Failure::canceled(format!(
                    "activity {} canceled",
                    m.activity_id
                ))),
            }],
        )),
        // Cancel raced a real resolution: the activity won. Absorb; the
        // future is already resolved when the policy resolved eagerly.
        (
            EventAttributes::ActivityCompleted { result, .. },
            CancellationCommandSent | CanceledAfterInitiated | CanceledAfterStarted,
        ) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Ok(result.clone()),
            }],
        )),
        (
            EventAttributes::ActivityFailed { failure, .. },
            CancellationCommandSent | CanceledAfterInitiated | CanceledAfterStarted,
        ) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(wrap_activity_failure(&m.activity_type, failure.clone())),
            }],
        )),
        (
            EventAttributes::ActivityTimedOut { timeout_kind, .. },
            CancellationCommandSent | CanceledAfterInitiated | CanceledAfterStarted,
        ) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(wrap_activity_failure(
                    &m.activity_type,
                    Failure::timeout(*timeout_kind),
                )),
            }],
        )),
        _ => Err(unexpected("Activity", state, event)),
    }
}

/// What `cancel()` decided to do; the decider materializes it.
pub(crate) struct ActivityCancelOutcome {
    pub(crate) new_state: MachineState,
    pub(crate) command: Option<Command>,
    /// Resolve the result future with a canceled failure right now.
    pub(crate) resolve_now: bool,
}

pub(crate) fn cancel(m: &mut ActivityMachine, state: MachineState) -> ActivityCancelOutcome {
    use ActivityCancellationType::*;
    use MachineState::*;
    match state {
        // Not flushed yet: the command simply never goes out.
        Created => ActivityCancelOutcome {
            new_state: CanceledBeforeInitiated,
            command: None,
            resolve_now: true,
        },
        // Flushed but not yet recorded: remember, chase on the record.
        CommandSent => ActivityCancelOutcome {
            new_state: CanceledBeforeInitiated,
            command: None,
            resolve_now: m.cancellation_type != WaitCancellationCompleted,
        },
        Initiated | Started => match m.cancellation_type {
            Abandon => {
                m.abandoned = true;
                ActivityCancelOutcome {
                    new_state: state,
                    command: None,
                    resolve_now: true,
                }
            }
            TryCancel | WaitCancellationCompleted => ActivityCancelOutcome {
                new_state: if state == Initiated {
                    CanceledAfterInitiated
                } else {
                    CanceledAfterStarted
                },
                command: Some(Command::RequestCancelActivity {
                    activity_id: m.activity_id.clone(),
                }),
                resolve_now: m.cancellation_type == TryCancel,
            },
        },
        // Already cancelling or done; nothing more to do.
        _ => ActivityCancelOutcome {
            new_state: state,
            command: None,
            resolve_now: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn machine() -> ActivityMachine {
        ActivityMachine {
            seq: 1,
            activity_id: "1".into(),
            activity_type: "Echo".into(),
            cancellation_type: ActivityCancellationType::TryCancel,
            result_handle: 0,
            scheduled_event_id: None,
            abandoned: false,
        }
    }

    fn event(event_id: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            attributes,
        }
    }

    #[test]
    fn happy_path_walks_to_completed() {
        let mut m = machine();
        let scheduled = event(
            5,
            EventAttributes::ActivityScheduled {
                activity_id: "1".into(),
                activity_type: "Echo".into(),
                task_queue: "q".into(),
                input: None,
            },
        );
        let (state, actions) = on_event(&mut m, MachineState::CommandSent, &scheduled).unwrap();
        assert_eq!(state, MachineState::Initiated);
        assert!(actions.is_empty());
        assert_eq!(m.scheduled_event_id, Some(5));

        let started = event(
            6,
            EventAttributes::ActivityStarted {
                scheduled_event_id: 5,
                attempt: 1,
            },
        );
        let (state, _) = on_event(&mut m, state, &started).unwrap();
        assert_eq!(state, MachineState::Started);

        let completed = event(
            7,
            EventAttributes::ActivityCompleted {
                scheduled_event_id: 5,
                result: None,
            },
        );
        let (state, actions) = on_event(&mut m, state, &completed).unwrap();
        assert_eq!(state, MachineState::Completed);
        assert!(matches!(
            actions.as_slice(),
            [MachineAction::Resolve {
                result: Ok(None),
                ..
            }]
        ));
    }

    #[test]
    fn failure_wraps_the_cause() {
        let mut m = machine();
        let failed = event(
            7,
            EventAttributes::ActivityFailed {
                scheduled_event_id: 5,
                failure: Failure::application("boom"),
            },
        );
        let (_, actions) = on_event(&mut m, MachineState::Started, &failed).unwrap();
        match &actions[0] {
            MachineAction::Resolve {
                result: Err(f), ..
            } => {
                assert_eq!(f.kind, FailureKind::Activity);
                assert_eq!(f.cause.as_ref().unwrap().message, "boom");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn cancel_before_flush_drops_the_command() {
        let mut m = machine();
        let outcome = cancel(&mut m, MachineState::Created);
        assert_eq!(outcome.new_state, MachineState::CanceledBeforeInitiated);
        assert!(outcome.command.is_none());
        assert!(outcome.resolve_now);
    }

    #[test]
    fn cancel_after_initiation_chases_with_a_command() {
        let mut m = machine();
        let outcome = cancel(&mut m, MachineState::Initiated);
        assert_eq!(outcome.new_state, MachineState::CanceledAfterInitiated);
        assert!(matches!(
            outcome.command,
            Some(Command::RequestCancelActivity { .. })
        ));
        assert!(outcome.resolve_now);
    }

    #[test]
    fn wait_completed_defers_resolution_to_the_canceled_event() {
        let mut m = ActivityMachine {
            cancellation_type: ActivityCancellationType::WaitCancellationCompleted,
            ..machine()
        };
        let outcome = cancel(&mut m, MachineState::Started);
        assert!(!outcome.resolve_now);

        let canceled = event(
            9,
            EventAttributes::ActivityCanceled {
                scheduled_event_id: 5,
                details: None,
            },
        );
        let (state, actions) = on_event(&mut m, outcome.new_state, &canceled)
            .map(|(s, a)| (s, a))
            .unwrap();
        // The cancel-requested record normally precedes this, but the
        // machine tolerates a direct cancel record too.
        assert_eq!(state, MachineState::Completed);
        assert!(matches!(
            &actions[0],
            MachineAction::Resolve { result: Err(f), .. } if f.is_canceled()
        ));
    }

    #[test]
    fn unexpected_event_is_nondeterminism() {
        let mut m = machine();
        let fired = event(
            7,
            EventAttributes::TimerFired {
                started_event_id: 5,
                timer_id: "0".into(),
            },
        );
        assert!(matches!(
            on_event(&mut m, MachineState::Initiated, &fired),
            Err(DeciderError::NonDeterministic(_))
        ));
    }
}
