//! Worker-side boundary of the replay engine: the orchestration-service
//! RPC surface, a retrying client, pollers with bounded dispatch, and the
//! activity task handler. The replay core itself lives in
//! `windward-decider`; this crate only moves tasks in and responses out.

pub mod activity;
pub mod retry;
pub mod service;
pub mod worker;

pub use activity::{ActivityContext, ActivityFn, ActivityRegistry, ActivityTaskHandler, activity_fn};
pub use retry::{CallRetryConfig, RetryingClient};
pub use service::{
    ActivityHandle, RecordHeartbeatRequest, RecordHeartbeatResponse,
    RespondQueryTaskCompletedRequest, RespondWorkflowTaskCompletedRequest,
    RespondWorkflowTaskFailedRequest, ServiceError, ServiceErrorCode, ServiceResult,
    StartWorkflowRequest, StartWorkflowResponse, WorkflowService,
};
pub use worker::{Worker, WorkerConfig, WorkerShutdownHandle};
