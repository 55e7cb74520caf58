//! Inbound task shapes delivered by the orchestration service and the
//! response shapes returned to it.

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::event::HistoryEvent;
use crate::execution::WorkflowExecution;
use crate::failure::Failure;
use crate::payload::Payload;

/// Legacy query attached to a workflow task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    pub query_type: String,
    pub args: Option<Payload>,
}

/// A unit of work from the server: "here is new history since your last
/// task, tell me what commands to issue next".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub task_token: Vec<u8>,
    pub execution: WorkflowExecution,
    pub workflow_type: String,
    /// Full history for a fresh run, or the new page since the previous
    /// task when routed to a sticky queue.
    pub history: Vec<HistoryEvent>,
    /// 0 when no previous task has started; anything greater means replay.
    pub previous_started_event_id: i64,
    pub started_event_id: i64,
    pub query: Option<QueryInput>,
    pub next_page_token: Option<Vec<u8>>,
}

impl WorkflowTask {
    /// Whether this task carries history from the very beginning of the run.
    /// Such a task unconditionally invalidates any cached decider.
    pub fn starts_at_history_begin(&self) -> bool {
        self.history.first().map(|e| e.event_id) == Some(1)
    }
}

/// Why a workflow task was reported failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowTaskFailedCause {
    /// Replay diverged from recorded history; the server should reset the
    /// sticky task queue and redeliver from the start.
    NonDeterminism,
    /// Workflow code raised a failure configured to fail the task rather
    /// than the workflow.
    WorkflowError,
}

/// Outbound result of handling one workflow task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkflowTaskResponse {
    Completed {
        commands: Vec<Command>,
        /// Ask the server for an immediate follow-up task, e.g. when a
        /// local activity still has retries pending.
        force_new_task: bool,
        /// Sticky queue to route this run's next task to, if caching is on.
        sticky_queue: Option<String>,
    },
    Failed {
        cause: WorkflowTaskFailedCause,
        failure: Failure,
    },
    QueryCompleted {
        result: Result<Payload, String>,
    },
}

/// A unit of activity work from the server's activity task queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_token: Vec<u8>,
    pub execution: WorkflowExecution,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Option<Payload>,
    pub heartbeat_timeout_ms: Option<i64>,
    pub start_to_close_timeout_ms: Option<i64>,
    pub attempt: u32,
}
