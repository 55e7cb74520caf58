//! Activity task handling: the embarrassingly parallel half of the worker.
//!
//! Each polled activity task is dispatched to a registered activity
//! function with a context that can heartbeat and observe cancellation.
//! Cancellation of activities is cooperative: the server piggybacks the
//! cancel request on a heartbeat response, and the activity winds down on
//! its own schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use windward_types::task::ActivityTask;
use windward_types::{Failure, Payload, WorkflowExecution};

use crate::service::{
    ActivityHandle, RecordHeartbeatRequest, ServiceResult, WorkflowService,
};

/// Handed to each activity invocation.
pub struct ActivityContext {
    service: Arc<dyn WorkflowService>,
    task_token: Vec<u8>,
    execution: WorkflowExecution,
    activity_id: String,
    activity_type: String,
    attempt: u32,
    cancel_requested: Arc<AtomicBool>,
}

impl ActivityContext {
    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report liveness. The response may carry the workflow's cancel
    /// request; after that [`Self::is_cancel_requested`] turns true.
    pub async fn record_heartbeat(&self, details: Option<Payload>) -> ServiceResult<()> {
        let response = self
            .service
            .record_activity_heartbeat(RecordHeartbeatRequest {
                handle: ActivityHandle::TaskToken(self.task_token.clone()),
                details,
            })
            .await?;
        if response.cancel_requested {
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// An activity implementation.
pub type ActivityFn = Arc<
    dyn Fn(ActivityContext, Option<Payload>) -> BoxFuture<'static, Result<Option<Payload>, Failure>>
        + Send
        + Sync,
>;

/// Wrap a plain async closure as an [`ActivityFn`].
pub fn activity_fn<F, Fut>(f: F) -> ActivityFn
where
    F: Fn(ActivityContext, Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Payload>, Failure>> + Send + 'static,
{
    Arc::new(move |ctx, input| Box::pin(f(ctx, input)))
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    by_type: HashMap<String, ActivityFn>,
}

impl ActivityRegistry {
    pub fn register(&mut self, activity_type: impl Into<String>, f: ActivityFn) {
        self.by_type.insert(activity_type.into(), f);
    }

    pub fn get(&self, activity_type: &str) -> Option<&ActivityFn> {
        self.by_type.get(activity_type)
    }
}

/// Executes one activity task and reports its outcome.
pub struct ActivityTaskHandler {
    service: Arc<dyn WorkflowService>,
    registry: ActivityRegistry,
}

impl ActivityTaskHandler {
    pub fn new(service: Arc<dyn WorkflowService>, registry: ActivityRegistry) -> Self {
        Self { service, registry }
    }

    pub async fn handle(&self, task: ActivityTask) -> ServiceResult<()> {
        let handle = ActivityHandle::TaskToken(task.task_token.clone());
        let Some(f) = self.registry.get(&task.activity_type) else {
            warn!(activity_type = %task.activity_type, "activity type not registered");
            return self
                .service
                .respond_activity_task_failed(
                    handle,
                    Failure::application(format!(
                        "activity type {} is not registered on this worker",
                        task.activity_type
                    )),
                )
                .await;
        };

        let ctx = ActivityContext {
            service: self.service.clone(),
            task_token: task.task_token.clone(),
            execution: task.execution.clone(),
            activity_id: task.activity_id.clone(),
            activity_type: task.activity_type.clone(),
            attempt: task.attempt,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        };

        debug!(
            activity_type = %task.activity_type,
            activity_id = %task.activity_id,
            attempt = task.attempt,
            "executing activity"
        );
        match f(ctx, task.input.clone()).await {
            Ok(result) => {
                self.service
                    .respond_activity_task_completed(handle, result)
                    .await
            }
            Err(failure) if failure.is_canceled() => {
                self.service
                    .respond_activity_task_canceled(handle, failure.payload.clone())
                    .await
            }
            Err(failure) => {
                self.service
                    .respond_activity_task_failed(handle, failure)
                    .await
            }
        }
    }
}
