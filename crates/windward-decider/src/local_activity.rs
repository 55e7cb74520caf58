//! Local activities: worker-side invocations that bypass the server task
//! queue and persist their outcome as history markers.
//!
//! Retries run inside the current workflow task while they fit in the
//! task's timeout budget; the residual backoff of an attempt that does not
//! fit rides in the marker and a forced follow-up task retries it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::debug;
use windward_types::{Failure, FailureKind, LocalActivityOptions, Payload};

/// A local activity implementation.
pub type LocalActivityFn =
    Arc<dyn Fn(Option<Payload>) -> BoxFuture<'static, Result<Option<Payload>, Failure>> + Send + Sync>;

/// Wrap a plain async closure as a [`LocalActivityFn`].
pub fn local_activity_fn<F, Fut>(f: F) -> LocalActivityFn
where
    F: Fn(Option<Payload>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Payload>, Failure>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Local activities registered on a worker, by type name.
#[derive(Clone, Default)]
pub struct LocalActivityRegistry {
    by_type: HashMap<String, LocalActivityFn>,
}

impl LocalActivityRegistry {
    pub fn register(&mut self, activity_type: impl Into<String>, f: LocalActivityFn) {
        self.by_type.insert(activity_type.into(), f);
    }

    pub fn get(&self, activity_type: &str) -> Option<&LocalActivityFn> {
        self.by_type.get(activity_type)
    }
}

/// A local-activity execution request handed from the decider to the
/// executor.
#[derive(Clone, Debug)]
pub struct LocalActivityRequest {
    pub seq: u32,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Option<Payload>,
    pub options: LocalActivityOptions,
    /// 1-based attempt to start from; greater than 1 when a prior task's
    /// marker carried a residual backoff.
    pub attempt: u32,
    /// Workflow-time floor before the next attempt may run; 0 when
    /// immediate.
    pub not_before_ms: i64,
}

/// How a local activity execution round ended.
#[derive(Clone, Debug)]
pub enum LocalActivityOutcome {
    Completed {
        result: Option<Payload>,
        attempt: u32,
    },
    /// Retries exhausted or the error type is non-retryable.
    Failed {
        failure: Failure,
        attempt: u32,
    },
    /// The next backoff does not fit in the workflow task budget; retry on
    /// a forced follow-up task.
    Deferred {
        failure: Failure,
        attempt: u32,
        backoff_ms: i64,
    },
}

/// Execute one local activity with in-task retries.
///
/// Attempts loop as long as `elapsed + backoff` stays inside `budget`,
/// awaiting the backoff on the runtime timer rather than blocking the
/// worker thread. `local_retry_threshold_ms` lowers the in-task ceiling
/// further when configured.
pub async fn run_local_activity(
    request: &LocalActivityRequest,
    f: &LocalActivityFn,
    budget_ms: i64,
) -> LocalActivityOutcome {
    let started = Instant::now();
    let policy = request.options.retry_policy.clone().unwrap_or_default();
    let threshold = request
        .options
        .local_retry_threshold_ms
        .unwrap_or(budget_ms)
        .min(budget_ms);
    let mut attempt = request.attempt;

    loop {
        match f(request.input.clone()).await {
            Ok(result) => {
                return LocalActivityOutcome::Completed { result, attempt };
            }
            Err(failure) => {
                debug!(
                    activity_id = %request.activity_id,
                    attempt,
                    error = %failure,
                    "local activity attempt failed"
                );
                if policy.is_non_retryable(failure_type_of(&failure)) {
                    return LocalActivityOutcome::Failed { failure, attempt };
                }
                let Some(backoff_ms) = policy.backoff_for(attempt) else {
                    return LocalActivityOutcome::Failed { failure, attempt };
                };
                let elapsed_ms = started.elapsed().as_millis() as i64;
                if elapsed_ms + backoff_ms >= threshold {
                    return LocalActivityOutcome::Deferred {
                        failure,
                        attempt,
                        backoff_ms,
                    };
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms as u64)).await;
                attempt += 1;
            }
        }
    }
}

/// The error-type string matched against `non_retryable_error_types`.
fn failure_type_of(failure: &Failure) -> &str {
    match failure.kind {
        FailureKind::Application => failure.detail.as_deref().unwrap_or("Application"),
        _ => "Application",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use windward_types::RetryPolicy;

    fn request(policy: RetryPolicy) -> LocalActivityRequest {
        LocalActivityRequest {
            seq: 0,
            activity_id: "0".into(),
            activity_type: "Flaky".into(),
            input: None,
            options: LocalActivityOptions {
                retry_policy: Some(policy),
                ..LocalActivityOptions::default()
            },
            attempt: 1,
            not_before_ms: 0,
        }
    }

    fn failing_until(succeed_on: u32) -> (LocalActivityFn, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let f = local_activity_fn(move |_| {
            let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= succeed_on {
                    Ok(Some(Payload::json(&n).unwrap()))
                } else {
                    Err(Failure::application("not yet"))
                }
            }
        });
        (f, calls)
    }

    #[tokio::test]
    async fn retries_in_task_until_success() {
        let policy = RetryPolicy {
            initial_interval_ms: 1,
            backoff_coefficient: 1.0,
            maximum_interval_ms: 1,
            maximum_attempts: 10,
            non_retryable_error_types: vec![],
        };
        let (f, calls) = failing_until(3);
        let outcome = run_local_activity(&request(policy), &f, 60_000).await;
        assert!(matches!(
            outcome,
            LocalActivityOutcome::Completed { attempt: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oversized_backoff_defers_to_the_next_task() {
        let policy = RetryPolicy {
            initial_interval_ms: 120_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 120_000,
            maximum_attempts: 5,
            non_retryable_error_types: vec![],
        };
        let (f, _) = failing_until(99);
        let outcome = run_local_activity(&request(policy), &f, 10_000).await;
        match outcome {
            LocalActivityOutcome::Deferred {
                attempt,
                backoff_ms,
                ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(backoff_ms, 120_000);
            }
            other => panic!("expected deferral, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_terminally() {
        let policy = RetryPolicy {
            initial_interval_ms: 1,
            backoff_coefficient: 1.0,
            maximum_interval_ms: 1,
            maximum_attempts: 2,
            non_retryable_error_types: vec![],
        };
        let (f, calls) = failing_until(99);
        let outcome = run_local_activity(&request(policy), &f, 60_000).await;
        assert!(matches!(
            outcome,
            LocalActivityOutcome::Failed { attempt: 2, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
