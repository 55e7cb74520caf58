//! Per-operation option structs and the policies hanging off them.
//!
//! Durations are carried as whole milliseconds (`i64`) and rounded up to
//! whole seconds before they are put on the wire, matching the service's
//! second-granularity timeout fields.

use serde::{Deserialize, Serialize};

/// Round a millisecond duration up to the next whole second.
pub fn round_up_to_seconds(ms: i64) -> i64 {
    if ms <= 0 {
        return 0;
    }
    ((ms + 999) / 1_000) * 1_000
}

/// Retry behavior for activities, local activities, and child workflows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: i64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: i64,
    /// 0 means unlimited.
    pub maximum_attempts: u32,
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 100_000,
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait before attempt `attempt + 1`, given that `attempt`
    /// (1-based) just failed. `None` means retries are exhausted.
    pub fn backoff_for(&self, attempt: u32) -> Option<i64> {
        if self.maximum_attempts != 0 && attempt >= self.maximum_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1);
        let interval = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exp as i32);
        Some((interval as i64).min(self.maximum_interval_ms).max(0))
    }

    pub fn is_non_retryable(&self, error_type: &str) -> bool {
        self.non_retryable_error_types
            .iter()
            .any(|t| t == error_type)
    }
}

/// Client-side policy for what an activity cancel request waits on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityCancellationType {
    /// Send the cancel request and resolve the future immediately.
    #[default]
    TryCancel,
    /// Resolve only once the server records the cancellation.
    WaitCancellationCompleted,
    /// Resolve immediately with no wire command; the activity runs to
    /// completion in the background.
    Abandon,
}

/// Client-side policy for what a child-workflow cancel waits on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildWorkflowCancellationType {
    /// Detach immediately; no wire command is issued.
    Abandon,
    /// Send the cancel request and return.
    TryCancel,
    /// Wait for the server to acknowledge the cancel request.
    WaitCancellationRequested,
    /// Wait for the child's terminal cancellation event.
    #[default]
    WaitCancellationCompleted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowIdReusePolicy {
    #[default]
    AllowDuplicate,
    AllowDuplicateFailedOnly,
    RejectDuplicate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentClosePolicy {
    #[default]
    Terminate,
    Abandon,
    RequestCancel,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error(
        "schedule_to_close is unset, so both schedule_to_start and start_to_close are required"
    )]
    MissingTimeouts,
    #[error("workflow_id must not be empty")]
    MissingWorkflowId,
}

/// Options for a server-dispatched activity invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Defaults to the decider-assigned sequence number when unset.
    pub activity_id: Option<String>,
    /// Defaults to the worker's task queue when unset.
    pub task_queue: Option<String>,
    pub heartbeat_timeout_ms: Option<i64>,
    pub schedule_to_close_timeout_ms: Option<i64>,
    pub schedule_to_start_timeout_ms: Option<i64>,
    pub start_to_close_timeout_ms: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
    pub cancellation_type: ActivityCancellationType,
}

impl ActivityOptions {
    /// Every scheduled operation needs a bounded lifetime: either an overall
    /// schedule-to-close, or both the queueing and execution bounds.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.schedule_to_close_timeout_ms.is_none()
            && (self.schedule_to_start_timeout_ms.is_none()
                || self.start_to_close_timeout_ms.is_none())
        {
            return Err(OptionsError::MissingTimeouts);
        }
        Ok(())
    }
}

/// Options for an activity executed on the worker without a server round
/// trip. Results ride in history markers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalActivityOptions {
    pub schedule_to_close_timeout_ms: Option<i64>,
    pub start_to_close_timeout_ms: Option<i64>,
    /// Retries with backoffs beyond this threshold are deferred to a later
    /// workflow task instead of sleeping inside the current one.
    pub local_retry_threshold_ms: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
    /// Leave the arguments out of the recorded marker to keep history small.
    pub do_not_include_arguments_in_marker: bool,
}

/// Options for starting a child workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    pub workflow_id: String,
    pub task_queue: Option<String>,
    pub workflow_run_timeout_ms: Option<i64>,
    pub workflow_execution_timeout_ms: Option<i64>,
    pub workflow_task_timeout_ms: Option<i64>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub cancellation_type: ChildWorkflowCancellationType,
    pub parent_close_policy: ParentClosePolicy,
}

impl ChildWorkflowOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.workflow_id.is_empty() {
            return Err(OptionsError::MissingWorkflowId);
        }
        Ok(())
    }
}

/// Options carried by a continue-as-new command.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueAsNewOptions {
    pub workflow_run_timeout_ms: Option<i64>,
    pub workflow_task_timeout_ms: Option<i64>,
    pub task_queue: Option<String>,
}
