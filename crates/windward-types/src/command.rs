//! Commands: buffered intents to mutate server state at the end of the
//! current workflow task.
//!
//! Every command the decider emits is eventually recorded by the server as
//! exactly one command event in history; replay matches them back up FIFO.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::execution::WorkflowExecution;
use crate::failure::Failure;
use crate::marker::MarkerData;
use crate::options::{ContinueAsNewOptions, RetryPolicy};
use crate::payload::Payload;

/// Timer id reserved for the synthetic zero-duration timer appended when a
/// single task would otherwise emit more commands than the server accepts.
/// Textual on purpose so it can never collide with sequence-derived ids.
pub const FORCE_IMMEDIATE_DECISION_TIMER_ID: &str = "FORCE_IMMEDIATE_DECISION";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleActivityAttributes {
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: Option<Payload>,
    pub heartbeat_timeout_ms: Option<i64>,
    pub schedule_to_close_timeout_ms: Option<i64>,
    pub schedule_to_start_timeout_ms: Option<i64>,
    pub start_to_close_timeout_ms: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTimerAttributes {
    pub timer_id: String,
    pub start_to_fire_timeout_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartChildWorkflowAttributes {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: Option<String>,
    pub input: Option<Payload>,
    pub workflow_run_timeout_ms: Option<i64>,
    pub workflow_execution_timeout_ms: Option<i64>,
    pub workflow_task_timeout_ms: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalExternalAttributes {
    pub execution: WorkflowExecution,
    pub signal_name: String,
    pub input: Option<Payload>,
    /// Restrict delivery to a child of this run.
    pub child_workflow_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelExternalAttributes {
    pub execution: WorkflowExecution,
    pub child_workflow_only: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewAttributes {
    pub workflow_type: String,
    pub input: Option<Payload>,
    pub options: ContinueAsNewOptions,
}

/// A buffered intent to mutate server state, queued until the workflow task
/// response is assembled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivity(ScheduleActivityAttributes),
    RequestCancelActivity { activity_id: String },
    StartTimer(StartTimerAttributes),
    CancelTimer { timer_id: String },
    RecordMarker(MarkerData),
    StartChildWorkflow(StartChildWorkflowAttributes),
    SignalExternal(SignalExternalAttributes),
    RequestCancelExternal(RequestCancelExternalAttributes),
    UpsertSearchAttributes { attributes: BTreeMap<String, Payload> },
    CompleteWorkflow { result: Option<Payload> },
    FailWorkflow { failure: Failure },
    CancelWorkflow { details: Option<Payload> },
    ContinueAsNew(ContinueAsNewAttributes),
}

impl Command {
    /// The variant name, for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivity(_) => "ScheduleActivity",
            Self::RequestCancelActivity { .. } => "RequestCancelActivity",
            Self::StartTimer(_) => "StartTimer",
            Self::CancelTimer { .. } => "CancelTimer",
            Self::RecordMarker(_) => "RecordMarker",
            Self::StartChildWorkflow(_) => "StartChildWorkflow",
            Self::SignalExternal(_) => "SignalExternal",
            Self::RequestCancelExternal(_) => "RequestCancelExternal",
            Self::UpsertSearchAttributes { .. } => "UpsertSearchAttributes",
            Self::CompleteWorkflow { .. } => "CompleteWorkflow",
            Self::FailWorkflow { .. } => "FailWorkflow",
            Self::CancelWorkflow { .. } => "CancelWorkflow",
            Self::ContinueAsNew(_) => "ContinueAsNew",
        }
    }

    /// Whether this command ends the workflow. A task whose last command is
    /// terminal never needs the force-immediate-decision timer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_commands_are_exactly_the_four_workflow_closers() {
        let terminal = [
            Command::CompleteWorkflow { result: None },
            Command::FailWorkflow {
                failure: Failure::application("x"),
            },
            Command::CancelWorkflow { details: None },
            Command::ContinueAsNew(ContinueAsNewAttributes {
                workflow_type: "t".into(),
                input: None,
                options: ContinueAsNewOptions::default(),
            }),
        ];
        assert!(terminal.iter().all(Command::is_terminal));

        let open = Command::StartTimer(StartTimerAttributes {
            timer_id: "1".into(),
            start_to_fire_timeout_ms: 0,
        });
        assert!(!open.is_terminal());
    }
}
