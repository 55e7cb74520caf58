//! Retrying wrapper over the service client.
//!
//! Every call retries transient faults with jittered exponential backoff,
//! except `respond_query_task_completed`: a query answer is only useful to
//! the waiting caller once, so it gets a single attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use windward_types::task::{ActivityTask, WorkflowTask};
use windward_types::{Failure, HistoryEvent, Payload, QueryInput, WorkflowExecution};

use crate::service::{
    ActivityHandle, RecordHeartbeatRequest, RecordHeartbeatResponse,
    RespondQueryTaskCompletedRequest, RespondWorkflowTaskCompletedRequest,
    RespondWorkflowTaskFailedRequest, ServiceResult, StartWorkflowRequest, StartWorkflowResponse,
    WorkflowService,
};

/// Backoff schedule for service calls.
#[derive(Clone, Debug)]
pub struct CallRetryConfig {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for CallRetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl CallRetryConfig {
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_interval_ms as f64 * self.backoff_coefficient.powi(exp as i32);
        (base as u64).min(self.maximum_interval_ms)
    }
}

/// Service client with the retry policy applied uniformly.
pub struct RetryingClient {
    inner: Arc<dyn WorkflowService>,
    config: CallRetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn WorkflowService>, config: CallRetryConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff_ms(attempt);
                    // Jitter spreads retry storms across workers.
                    let jittered =
                        (backoff as f64 * rand::rng().random_range(0.8..1.2)) as u64;
                    warn!(op, attempt, backoff_ms = jittered, error = %e, "retrying service call");
                    tokio::time::sleep(Duration::from_millis(jittered)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl WorkflowService for RetryingClient {
    async fn poll_workflow_task(&self, task_queue: &str) -> ServiceResult<Option<WorkflowTask>> {
        self.with_retry("poll_workflow_task", || {
            self.inner.poll_workflow_task(task_queue)
        })
        .await
    }

    async fn poll_activity_task(&self, task_queue: &str) -> ServiceResult<Option<ActivityTask>> {
        self.with_retry("poll_activity_task", || {
            self.inner.poll_activity_task(task_queue)
        })
        .await
    }

    async fn respond_workflow_task_completed(
        &self,
        request: RespondWorkflowTaskCompletedRequest,
    ) -> ServiceResult<()> {
        self.with_retry("respond_workflow_task_completed", || {
            self.inner.respond_workflow_task_completed(request.clone())
        })
        .await
    }

    async fn respond_workflow_task_failed(
        &self,
        request: RespondWorkflowTaskFailedRequest,
    ) -> ServiceResult<()> {
        self.with_retry("respond_workflow_task_failed", || {
            self.inner.respond_workflow_task_failed(request.clone())
        })
        .await
    }

    /// Single attempt: the query caller has usually timed out by the time
    /// a retry would land.
    async fn respond_query_task_completed(
        &self,
        request: RespondQueryTaskCompletedRequest,
    ) -> ServiceResult<()> {
        self.inner.respond_query_task_completed(request).await
    }

    async fn respond_activity_task_completed(
        &self,
        handle: ActivityHandle,
        result: Option<Payload>,
    ) -> ServiceResult<()> {
        self.with_retry("respond_activity_task_completed", || {
            self.inner
                .respond_activity_task_completed(handle.clone(), result.clone())
        })
        .await
    }

    async fn respond_activity_task_failed(
        &self,
        handle: ActivityHandle,
        failure: Failure,
    ) -> ServiceResult<()> {
        self.with_retry("respond_activity_task_failed", || {
            self.inner
                .respond_activity_task_failed(handle.clone(), failure.clone())
        })
        .await
    }

    async fn respond_activity_task_canceled(
        &self,
        handle: ActivityHandle,
        details: Option<Payload>,
    ) -> ServiceResult<()> {
        self.with_retry("respond_activity_task_canceled", || {
            self.inner
                .respond_activity_task_canceled(handle.clone(), details.clone())
        })
        .await
    }

    async fn record_activity_heartbeat(
        &self,
        request: RecordHeartbeatRequest,
    ) -> ServiceResult<RecordHeartbeatResponse> {
        self.with_retry("record_activity_heartbeat", || {
            self.inner.record_activity_heartbeat(request.clone())
        })
        .await
    }

    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> ServiceResult<StartWorkflowResponse> {
        self.with_retry("start_workflow", || {
            self.inner.start_workflow(request.clone())
        })
        .await
    }

    async fn signal_workflow(
        &self,
        execution: WorkflowExecution,
        signal_name: String,
        input: Option<Payload>,
    ) -> ServiceResult<()> {
        self.with_retry("signal_workflow", || {
            self.inner
                .signal_workflow(execution.clone(), signal_name.clone(), input.clone())
        })
        .await
    }

    async fn signal_with_start_workflow(
        &self,
        request: StartWorkflowRequest,
        signal_name: String,
        signal_input: Option<Payload>,
    ) -> ServiceResult<StartWorkflowResponse> {
        self.with_retry("signal_with_start_workflow", || {
            self.inner.signal_with_start_workflow(
                request.clone(),
                signal_name.clone(),
                signal_input.clone(),
            )
        })
        .await
    }

    async fn request_cancel_workflow(
        &self,
        execution: WorkflowExecution,
        reason: Option<String>,
    ) -> ServiceResult<()> {
        self.with_retry("request_cancel_workflow", || {
            self.inner
                .request_cancel_workflow(execution.clone(), reason.clone())
        })
        .await
    }

    async fn get_workflow_history(
        &self,
        execution: WorkflowExecution,
    ) -> ServiceResult<Vec<HistoryEvent>> {
        self.with_retry("get_workflow_history", || {
            self.inner.get_workflow_history(execution.clone())
        })
        .await
    }

    async fn query_workflow(
        &self,
        execution: WorkflowExecution,
        query: QueryInput,
    ) -> ServiceResult<Payload> {
        self.with_retry("query_workflow", || {
            self.inner.query_workflow(execution.clone(), query.clone())
        })
        .await
    }

    async fn list_open_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>> {
        self.with_retry("list_open_workflows", || self.inner.list_open_workflows())
            .await
    }

    async fn list_closed_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>> {
        self.with_retry("list_closed_workflows", || self.inner.list_closed_workflows())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceError, ServiceErrorCode};
    use similar_asserts::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stub that fails `failures` times before succeeding, for the calls
    /// the tests exercise. Everything else is unreachable.
    struct FlakyService {
        failures: u32,
        code: ServiceErrorCode,
        start_calls: AtomicU32,
        query_calls: AtomicU32,
    }

    impl FlakyService {
        fn new(failures: u32, code: ServiceErrorCode) -> Self {
            Self {
                failures,
                code,
                start_calls: AtomicU32::new(0),
                query_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkflowService for FlakyService {
        async fn poll_workflow_task(&self, _: &str) -> ServiceResult<Option<WorkflowTask>> {
            unimplemented!()
        }
        async fn poll_activity_task(&self, _: &str) -> ServiceResult<Option<ActivityTask>> {
            unimplemented!()
        }
        async fn respond_workflow_task_completed(
            &self,
            _: RespondWorkflowTaskCompletedRequest,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn respond_workflow_task_failed(
            &self,
            _: RespondWorkflowTaskFailedRequest,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn respond_query_task_completed(
            &self,
            _: RespondQueryTaskCompletedRequest,
        ) -> ServiceResult<()> {
            let n = self.query_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(ServiceError::new(self.code, "query flake"))
            } else {
                Ok(())
            }
        }
        async fn respond_activity_task_completed(
            &self,
            _: ActivityHandle,
            _: Option<Payload>,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn respond_activity_task_failed(
            &self,
            _: ActivityHandle,
            _: Failure,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn respond_activity_task_canceled(
            &self,
            _: ActivityHandle,
            _: Option<Payload>,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn record_activity_heartbeat(
            &self,
            _: RecordHeartbeatRequest,
        ) -> ServiceResult<RecordHeartbeatResponse> {
            unimplemented!()
        }
        async fn start_workflow(
            &self,
            _: StartWorkflowRequest,
        ) -> ServiceResult<StartWorkflowResponse> {
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(ServiceError::new(self.code, "start flake"))
            } else {
                Ok(StartWorkflowResponse {
                    run_id: "r1".into(),
                })
            }
        }
        async fn signal_workflow(
            &self,
            _: WorkflowExecution,
            _: String,
            _: Option<Payload>,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn signal_with_start_workflow(
            &self,
            _: StartWorkflowRequest,
            _: String,
            _: Option<Payload>,
        ) -> ServiceResult<StartWorkflowResponse> {
            unimplemented!()
        }
        async fn request_cancel_workflow(
            &self,
            _: WorkflowExecution,
            _: Option<String>,
        ) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn get_workflow_history(
            &self,
            _: WorkflowExecution,
        ) -> ServiceResult<Vec<HistoryEvent>> {
            unimplemented!()
        }
        async fn query_workflow(
            &self,
            _: WorkflowExecution,
            _: QueryInput,
        ) -> ServiceResult<Payload> {
            unimplemented!()
        }
        async fn list_open_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>> {
            unimplemented!()
        }
        async fn list_closed_workflows(&self) -> ServiceResult<Vec<WorkflowExecution>> {
            unimplemented!()
        }
    }

    fn fast_config() -> CallRetryConfig {
        CallRetryConfig {
            initial_interval_ms: 1,
            backoff_coefficient: 1.0,
            maximum_interval_ms: 1,
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let stub = Arc::new(FlakyService::new(3, ServiceErrorCode::Unavailable));
        let client = RetryingClient::new(stub.clone(), fast_config());
        let response = client
            .start_workflow(StartWorkflowRequest::default())
            .await
            .unwrap();
        assert_eq!(response.run_id, "r1");
        assert_eq!(stub.start_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_codes_fail_immediately() {
        let stub = Arc::new(FlakyService::new(3, ServiceErrorCode::InvalidArgument));
        let client = RetryingClient::new(stub.clone(), fast_config());
        let err = client
            .start_workflow(StartWorkflowRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ServiceErrorCode::InvalidArgument);
        assert_eq!(stub.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_responses_get_a_single_attempt() {
        let stub = Arc::new(FlakyService::new(3, ServiceErrorCode::Unavailable));
        let client = RetryingClient::new(stub.clone(), fast_config());
        let err = client
            .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                task_token: vec![1],
                result: Ok(Payload::json(&1u8).unwrap()),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(stub.query_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_to_the_cap() {
        let config = CallRetryConfig {
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 500,
            max_attempts: 10,
        };
        assert_eq!(config.backoff_ms(1), 100);
        assert_eq!(config.backoff_ms(2), 200);
        assert_eq!(config.backoff_ms(3), 400);
        assert_eq!(config.backoff_ms(4), 500);
    }
}
