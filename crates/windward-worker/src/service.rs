//! The orchestration-service RPC surface the worker programs against.
//!
//! Transport details live behind this trait; the worker only sees typed
//! requests, typed responses, and a coarse error code that decides
//! retryability.

use async_trait::async_trait;

use windward_types::task::{ActivityTask, WorkflowTask};
use windward_types::{
    Command, Failure, HistoryEvent, Payload, QueryInput, RetryPolicy, WorkflowExecution,
    WorkflowIdReusePolicy, WorkflowTaskFailedCause,
};

/// Coarse RPC status. Mirrors the service's error model closely enough to
/// drive retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceErrorCode {
    Unavailable,
    Internal,
    ResourceExhausted,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    /// `StartWorkflowExecution` hit a duplicate id under a rejecting reuse
    /// policy. Surfaces to the caller synchronously, never to workflow
    /// code.
    AlreadyExists,
    DeadlineExceeded,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct ServiceError {
    pub code: ServiceErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Transient faults retry with backoff; argument and precondition
    /// errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ServiceErrorCode::Unavailable
                | ServiceErrorCode::Internal
                | ServiceErrorCode::ResourceExhausted
                | ServiceErrorCode::DeadlineExceeded
        )
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone, Debug, Default)]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Option<Payload>,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub workflow_run_timeout_ms: Option<i64>,
    pub workflow_task_timeout_ms: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct StartWorkflowResponse {
    pub run_id: String,
}

#[derive(Clone, Debug)]
pub struct RespondWorkflowTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub commands: Vec<Command>,
    pub force_create_new_task: bool,
    pub sticky_queue: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RespondWorkflowTaskFailedRequest {
    pub task_token: Vec<u8>,
    pub cause: WorkflowTaskFailedCause,
    pub failure: Failure,
}

#[derive(Clone, Debug)]
pub struct RespondQueryTaskCompletedRequest {
    pub task_token: Vec<u8>,
    pub result: Result<Payload, String>,
}

/// Identifies an activity either by its task token or by
/// `(execution, activity_id)`; the latter backs the `ById` RPC variants.
#[derive(Clone, Debug)]
pub enum ActivityHandle {
    TaskToken(Vec<u8>),
    ById {
        execution: WorkflowExecution,
        activity_id: String,
    },
}

#[derive(Clone, Debug)]
pub struct RecordHeartbeatRequest {
    pub handle: ActivityHandle,
    pub details: Option<Payload>,
}

#[derive(Clone, Debug)]
pub struct RecordHeartbeatResponse {
    /// The workflow asked for this activity to cancel; the activity should
    /// wind down cooperatively.
    pub cancel_requested: bool,
}

/// The full RPC surface of the orchestration service, as the worker and
/// client use it.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    async fn poll_workflow_task(&self, task_queue: &str) -> ServiceResult<Option<WorkflowTask>>;

    async fn poll_activity_task(&self, task_queue: &str) -> ServiceResult<Option<ActivityTask>>;

    async fn respond_workflow_task_completed(
        &self,
        request: RespondWorkflowTaskCompletedRequest,
    ) -> ServiceResult<()>;

    async fn respond_workflow_task_failed(
        &self,
        request: RespondWorkflowTaskFailedRequest,
    ) -> ServiceResult<()>;

    async fn respond_query_task_completed(
        &self,
        request: RespondQueryTaskCompletedRequest,
    ) -> ServiceResult<()>;

    async fn respond_activity_task_completed(
        &self,
        handle: ActivityHandle,
        result: Option<Payload>,
    ) -> ServiceResult<()>;

    async fn respond_activity_task_failed(
        &self,
        handle: ActivityHandle,
        failure: Failure,
    ) -> ServiceResult<()>;

    async fn respond_activity_task_canceled(
        &self,
        handle: ActivityHandle,
        details: Option<Payload>,
    ) -> ServiceResult<()>;

    async fn record_activity_heartbeat(
        &self,
        request: RecordHeartbeatRequest,
    ) -> ServiceResult<RecordHeartbeatResponse>;

    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> ServiceResult<StartWorkflowResponse>;

    async fn signal_workflow(
        &self,
        execution: WorkflowExecution,
        signal_name: String,
        input: Option<Payload>,
    ) -> ServiceResult<()>;

    async fn signal_with_start_workflow(
        &self,
        request: StartWorkflowRequest,
        signal_name: String,
        signal_input: Option<Payload>,
    ) -> ServiceResult<StartWorkflowResponse>;

    async fn request_cancel_workflow(
        &self,
        execution: WorkflowExecution,
        reason: Option<String>,
    ) -> ServiceResult<()>;

    async fn get_workflow_history(
        &self,
        execution: WorkflowExecution,
    ) -> ServiceResult<Vec<HistoryEvent>>;

    async fn query_workflow(
        &self,
        execution: WorkflowExecution,
        query: QueryInput,
    ) -> ServiceResult<Payload>;

    async fn list_open_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>>;

    async fn list_closed_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_code_table() {
        for code in [
            ServiceErrorCode::Unavailable,
            ServiceErrorCode::Internal,
            ServiceErrorCode::ResourceExhausted,
            ServiceErrorCode::DeadlineExceeded,
        ] {
            assert!(ServiceError::new(code, "x").is_retryable());
        }
        for code in [
            ServiceErrorCode::InvalidArgument,
            ServiceErrorCode::NotFound,
            ServiceErrorCode::FailedPrecondition,
            ServiceErrorCode::AlreadyExists,
        ] {
            assert!(!ServiceError::new(code, "x").is_retryable());
        }
    }
}
