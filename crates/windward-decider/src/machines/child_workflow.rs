//! Child-workflow state machine.
//!
//! Cancellation is a client-side policy. `Abandon` detaches immediately;
//! the other three route a cancel through a separate cancel-external
//! machine and differ only in what the parent's result future waits for.

use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::{ChildWorkflowCancellationType, Failure, FailureKind, Payload};

use super::{MachineAction, MachineState, unexpected};
use crate::error::DeciderError;
use crate::futures::FutureHandle;

pub(crate) struct ChildWorkflowMachine {
    pub(crate) seq: u32,
    pub(crate) workflow_id: String,
    pub(crate) workflow_type: String,
    pub(crate) cancellation_type: ChildWorkflowCancellationType,
    pub(crate) start_handle: FutureHandle,
    pub(crate) result_handle: FutureHandle,
    pub(crate) initiated_event_id: Option<i64>,
    pub(crate) abandoned: bool,
}

fn wrap_child_failure(workflow_type: &str, cause: Failure) -> Failure {
    Failure::new(
        FailureKind::ChildWorkflow,
        format!("child workflow {workflow_type} failed"),
    )
    .caused_by(cause)
}

pub(crate) fn on_event(
    m: &mut ChildWorkflowMachine,
    state: MachineState,
    event: &HistoryEvent,
) -> Result<(MachineState, Vec<MachineAction>), DeciderError> {
    use MachineState::*;
    match (&event.attributes, state) {
        (EventAttributes::ChildWorkflowInitiated { .. }, CommandSent) => {
            m.initiated_event_id = Some(event.event_id);
            Ok((Initiated, vec![]))
        }
        (EventAttributes::ChildWorkflowStarted { run_id, .. }, Initiated) => Ok((
            Started,
            vec![MachineAction::Resolve {
                handle: m.start_handle,
                result: Ok(Payload::json(run_id).ok()),
            }],
        )),
        (EventAttributes::ChildWorkflowStartFailed { cause, .. }, Initiated) => {
            let failure = Failure::new(
                FailureKind::ChildWorkflow,
                format!("child workflow start failed: {cause}"),
            );
            Ok((
                Completed,
                vec![
                    MachineAction::Resolve {
                        handle: m.start_handle,
                        result: Err(failure.clone()),
                    },
                    MachineAction::Resolve {
                        handle: m.result_handle,
                        result: Err(failure),
                    },
                ],
            ))
        }
        (EventAttributes::ChildWorkflowCompleted { result, .. }, Started) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Ok(result.clone()),
            }],
        )),
        (EventAttributes::ChildWorkflowFailed { failure, .. }, Started) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(wrap_child_failure(&m.workflow_type, failure.clone())),
            }],
        )),
        (EventAttributes::ChildWorkflowTimedOut { .. }, Started) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(Failure::new(
                    FailureKind::ChildWorkflow,
                    format!("child workflow {} timed out", m.workflow_type),
                )),
            }],
        )),
        // Terminal cancellation record. This is what
        // `WaitCancellationCompleted` parents are blocked on; for other
        // policies the resolve is a no-op because the future already
        // settled.
        (EventAttributes::ChildWorkflowCanceled { .. }, Started | CanceledAfterStarted) => Ok((
            Completed,
            vec![MachineAction::Resolve {
                handle: m.result_handle,
                result: Err(Failure::canceled(format!(
                    "child workflow {} canceled",
                    m.workflow_id
                ))),
            }],
        )),
        // Abandoned children still produce terminal events; absorb them.
        (
            EventAttributes::ChildWorkflowCompleted { .. }
            | EventAttributes::ChildWorkflowFailed { .. }
            | EventAttributes::ChildWorkflowTimedOut { .. }
            | EventAttributes::ChildWorkflowCanceled { .. },
            CanceledAfterInitiated,
        ) => Ok((Completed, vec![])),
        _ => Err(unexpected("ChildWorkflow", state, event)),
    }
}

/// What the decider must do for a child-workflow cancel request.
pub(crate) enum ChildCancelOutcome {
    /// Start command never flushed: drop it and resolve everything.
    DropUnsent,
    /// Detach; resolve the result future now, no wire traffic.
    Detach,
    /// Route a cancel-external command; `resolve_now` when the policy does
    /// not wait on any acknowledgement.
    CancelExternally { resolve_now: bool },
}

pub(crate) fn cancel(
    m: &mut ChildWorkflowMachine,
    state: MachineState,
) -> (MachineState, ChildCancelOutcome) {
    use ChildWorkflowCancellationType::*;
    use MachineState::*;
    match state {
        Created => (CanceledBeforeInitiated, ChildCancelOutcome::DropUnsent),
        CommandSent | Initiated | Started => match m.cancellation_type {
            Abandon => {
                m.abandoned = true;
                (
                    if state == Started {
                        Started
                    } else {
                        CanceledAfterInitiated
                    },
                    ChildCancelOutcome::Detach,
                )
            }
            TryCancel => (
                if state == Started {
                    CanceledAfterStarted
                } else {
                    state
                },
                ChildCancelOutcome::CancelExternally { resolve_now: true },
            ),
            WaitCancellationRequested | WaitCancellationCompleted => (
                if state == Started {
                    CanceledAfterStarted
                } else {
                    state
                },
                ChildCancelOutcome::CancelExternally { resolve_now: false },
            ),
        },
        other => (other, ChildCancelOutcome::Detach),
    }
}

pub(crate) fn canceled_failure(m: &ChildWorkflowMachine) -> Failure {
    Failure::canceled(format!("child workflow {} canceled", m.workflow_id))
}
