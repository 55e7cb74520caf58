//! History events: the immutable records a run's execution is rebuilt from.
//!
//! Events partition into *command events*, written by the server as the
//! direct record of a command from the previous workflow task, and
//! everything else. Command-initiation records carry their own event id as
//! the machine key; completion records point back at the initiation via an
//! explicit `*_event_id` field. That mapping is what
//! [`HistoryEvent::initial_command_event_id`] encodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::execution::WorkflowExecution;
use crate::failure::{Failure, TimeoutKind};
use crate::marker::MarkerData;
use crate::payload::Payload;

/// An immutable record in a run's append-only history.
///
/// `event_id` equals the record's 1-based position in the history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub attributes: EventAttributes,
}

/// Type-specific payload of a history event, one variant per record kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    // ── Workflow lifecycle ──
    /// Always the first event of a run.
    WorkflowStarted {
        workflow_type: String,
        input: Option<Payload>,
        /// The run id the execution began under; seeds deterministic ids.
        original_run_id: String,
        task_queue: String,
        workflow_task_timeout_ms: i64,
    },
    /// External signal delivered to this run.
    WorkflowSignaled {
        signal_name: String,
        input: Option<Payload>,
    },
    /// Someone asked this run to cancel. Cooperative from here on.
    WorkflowCancelRequested { reason: Option<String> },

    // ── Workflow task lifecycle ──
    WorkflowTaskScheduled,
    WorkflowTaskStarted { scheduled_event_id: i64 },
    WorkflowTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
    },
    WorkflowTaskFailed {
        scheduled_event_id: i64,
        cause: String,
    },
    WorkflowTaskTimedOut { scheduled_event_id: i64 },

    // ── Activity ──
    /// Command record: a ScheduleActivity command from the previous task.
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        task_queue: String,
        input: Option<Payload>,
    },
    ActivityStarted {
        scheduled_event_id: i64,
        attempt: u32,
    },
    ActivityCompleted {
        scheduled_event_id: i64,
        result: Option<Payload>,
    },
    ActivityFailed {
        scheduled_event_id: i64,
        failure: Failure,
    },
    ActivityTimedOut {
        scheduled_event_id: i64,
        timeout_kind: TimeoutKind,
    },
    /// Command record: a RequestCancelActivity command.
    ActivityCancelRequested { scheduled_event_id: i64 },
    ActivityCanceled {
        scheduled_event_id: i64,
        details: Option<Payload>,
    },

    // ── Timer ──
    /// Command record. For timers, initiation and start are the same event.
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout_ms: i64,
    },
    TimerFired {
        started_event_id: i64,
        timer_id: String,
    },
    /// Command record: a CancelTimer command.
    TimerCanceled {
        started_event_id: i64,
        timer_id: String,
    },

    // ── Marker ──
    /// Command record: fire-and-forget, no completion counterpart.
    MarkerRecorded(MarkerData),

    // ── Child workflow ──
    /// Command record: a StartChildWorkflow command.
    ChildWorkflowInitiated {
        workflow_id: String,
        workflow_type: String,
    },
    ChildWorkflowStarted {
        initiated_event_id: i64,
        run_id: String,
    },
    /// The start itself was rejected, e.g. duplicate id under a rejecting
    /// reuse policy.
    ChildWorkflowStartFailed {
        initiated_event_id: i64,
        cause: String,
    },
    ChildWorkflowCompleted {
        initiated_event_id: i64,
        result: Option<Payload>,
    },
    ChildWorkflowFailed {
        initiated_event_id: i64,
        failure: Failure,
    },
    ChildWorkflowTimedOut { initiated_event_id: i64 },
    ChildWorkflowCanceled {
        initiated_event_id: i64,
        details: Option<Payload>,
    },

    // ── External signal ──
    /// Command record: a SignalExternal command.
    SignalExternalInitiated {
        execution: WorkflowExecution,
        signal_name: String,
    },
    SignalExternalFailed {
        initiated_event_id: i64,
        cause: String,
    },
    ExternalSignaled { initiated_event_id: i64 },

    // ── External cancel ──
    /// Command record: a RequestCancelExternal command.
    CancelExternalInitiated { execution: WorkflowExecution },
    CancelExternalFailed {
        initiated_event_id: i64,
        cause: String,
    },
    ExternalCancelRequested { initiated_event_id: i64 },

    // ── Search attributes ──
    /// Command record: fire-and-forget like a marker.
    UpsertSearchAttributes {
        attributes: BTreeMap<String, Payload>,
    },

    // ── Terminal workflow records ──
    WorkflowCompleted { result: Option<Payload> },
    WorkflowFailed { failure: Failure },
    WorkflowCanceled { details: Option<Payload> },
    WorkflowContinuedAsNew { new_run_id: String },
}

impl EventAttributes {
    /// The variant name, for error messages and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "WorkflowStarted",
            Self::WorkflowSignaled { .. } => "WorkflowSignaled",
            Self::WorkflowCancelRequested { .. } => "WorkflowCancelRequested",
            Self::WorkflowTaskScheduled => "WorkflowTaskScheduled",
            Self::WorkflowTaskStarted { .. } => "WorkflowTaskStarted",
            Self::WorkflowTaskCompleted { .. } => "WorkflowTaskCompleted",
            Self::WorkflowTaskFailed { .. } => "WorkflowTaskFailed",
            Self::WorkflowTaskTimedOut { .. } => "WorkflowTaskTimedOut",
            Self::ActivityScheduled { .. } => "ActivityScheduled",
            Self::ActivityStarted { .. } => "ActivityStarted",
            Self::ActivityCompleted { .. } => "ActivityCompleted",
            Self::ActivityFailed { .. } => "ActivityFailed",
            Self::ActivityTimedOut { .. } => "ActivityTimedOut",
            Self::ActivityCancelRequested { .. } => "ActivityCancelRequested",
            Self::ActivityCanceled { .. } => "ActivityCanceled",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::TimerCanceled { .. } => "TimerCanceled",
            Self::MarkerRecorded(_) => "MarkerRecorded",
            Self::ChildWorkflowInitiated { .. } => "ChildWorkflowInitiated",
            Self::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            Self::ChildWorkflowStartFailed { .. } => "ChildWorkflowStartFailed",
            Self::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            Self::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            Self::ChildWorkflowTimedOut { .. } => "ChildWorkflowTimedOut",
            Self::ChildWorkflowCanceled { .. } => "ChildWorkflowCanceled",
            Self::SignalExternalInitiated { .. } => "SignalExternalInitiated",
            Self::SignalExternalFailed { .. } => "SignalExternalFailed",
            Self::ExternalSignaled { .. } => "ExternalSignaled",
            Self::CancelExternalInitiated { .. } => "CancelExternalInitiated",
            Self::CancelExternalFailed { .. } => "CancelExternalFailed",
            Self::ExternalCancelRequested { .. } => "ExternalCancelRequested",
            Self::UpsertSearchAttributes { .. } => "UpsertSearchAttributes",
            Self::WorkflowCompleted { .. } => "WorkflowCompleted",
            Self::WorkflowFailed { .. } => "WorkflowFailed",
            Self::WorkflowCanceled { .. } => "WorkflowCanceled",
            Self::WorkflowContinuedAsNew { .. } => "WorkflowContinuedAsNew",
        }
    }

    /// Whether this record is the server's direct record of a command from
    /// the previous workflow task. These are the records that follow
    /// `WorkflowTaskCompleted` and must each match one buffered command.
    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. }
                | Self::ActivityCancelRequested { .. }
                | Self::TimerStarted { .. }
                | Self::TimerCanceled { .. }
                | Self::MarkerRecorded(_)
                | Self::ChildWorkflowInitiated { .. }
                | Self::SignalExternalInitiated { .. }
                | Self::CancelExternalInitiated { .. }
                | Self::UpsertSearchAttributes { .. }
                | Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCanceled { .. }
                | Self::WorkflowContinuedAsNew { .. }
        )
    }
}

impl HistoryEvent {
    pub fn name(&self) -> &'static str {
        self.attributes.name()
    }

    pub fn is_command_event(&self) -> bool {
        self.attributes.is_command_event()
    }

    /// The event id of the command record a stateful event belongs to.
    ///
    /// Initiation records key machines by their own id; completion records
    /// by the id they reference. `None` for events with no backing machine.
    pub fn initial_command_event_id(&self) -> Option<i64> {
        use EventAttributes::*;
        match &self.attributes {
            ActivityScheduled { .. }
            | TimerStarted { .. }
            | MarkerRecorded(_)
            | ChildWorkflowInitiated { .. }
            | SignalExternalInitiated { .. }
            | CancelExternalInitiated { .. }
            | UpsertSearchAttributes { .. }
            | WorkflowTaskScheduled => Some(self.event_id),

            ActivityStarted { scheduled_event_id, .. }
            | ActivityCompleted { scheduled_event_id, .. }
            | ActivityFailed { scheduled_event_id, .. }
            | ActivityTimedOut { scheduled_event_id, .. }
            | ActivityCancelRequested { scheduled_event_id }
            | ActivityCanceled { scheduled_event_id, .. } => Some(*scheduled_event_id),

            TimerFired { started_event_id, .. } | TimerCanceled { started_event_id, .. } => {
                Some(*started_event_id)
            }

            ChildWorkflowStarted { initiated_event_id, .. }
            | ChildWorkflowStartFailed { initiated_event_id, .. }
            | ChildWorkflowCompleted { initiated_event_id, .. }
            | ChildWorkflowFailed { initiated_event_id, .. }
            | ChildWorkflowTimedOut { initiated_event_id }
            | ChildWorkflowCanceled { initiated_event_id, .. } => Some(*initiated_event_id),

            SignalExternalFailed { initiated_event_id, .. }
            | ExternalSignaled { initiated_event_id } => Some(*initiated_event_id),

            CancelExternalFailed { initiated_event_id, .. }
            | ExternalCancelRequested { initiated_event_id } => Some(*initiated_event_id),

            WorkflowTaskStarted { scheduled_event_id }
            | WorkflowTaskCompleted { scheduled_event_id, .. }
            | WorkflowTaskFailed { scheduled_event_id, .. }
            | WorkflowTaskTimedOut { scheduled_event_id } => Some(*scheduled_event_id),

            _ => None,
        }
    }

    /// Whether this event closes the workflow execution.
    pub fn is_final_workflow_event(&self) -> bool {
        matches!(
            self.attributes,
            EventAttributes::WorkflowCompleted { .. }
                | EventAttributes::WorkflowFailed { .. }
                | EventAttributes::WorkflowCanceled { .. }
                | EventAttributes::WorkflowContinuedAsNew { .. }
        )
    }
}
