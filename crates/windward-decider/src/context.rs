//! The API workflow code runs against.
//!
//! Everything here funnels into the shared per-run state: operations are
//! queued as [`WorkflowOp`]s for the decider to materialize, suspension
//! points are slot-backed futures, and the deterministic sources read
//! replayed counters. Nothing in this module talks to the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use rand::SeedableRng;
use rand::rngs::StdRng;
use uuid::Uuid;

use windward_types::{
    ActivityOptions, ChildWorkflowOptions, Failure, LocalActivityOptions, Payload,
    WorkflowExecution,
};

use crate::determinism;
use crate::futures::{FutureHandle, OpResult, WfFuture, poll_slot};
use crate::state::{QueryHandler, WfState, WorkflowOp, lock};

/// Version reported by `get_version` when replaying history that predates
/// the versioned change.
pub const DEFAULT_VERSION: i32 = -1;

/// The workflow definition: a function from context to the workflow's
/// eventual result. Produced by typed stub generation or written by hand.
pub type WorkflowFunction =
    Arc<dyn Fn(WfContext) -> BoxFuture<'static, crate::state::WorkflowResult> + Send + Sync>;

/// Wrap a plain async closure as a [`WorkflowFunction`].
pub fn workflow_fn<F, Fut>(f: F) -> WorkflowFunction
where
    F: Fn(WfContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::state::WorkflowResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Handle workflow code uses to perform operations and observe run state.
/// Cheap to clone; all clones observe the same run.
#[derive(Clone)]
pub struct WfContext {
    pub(crate) shared: Arc<Mutex<WfState>>,
}

impl WfContext {
    pub(crate) fn new(shared: Arc<Mutex<WfState>>) -> Self {
        Self { shared }
    }

    pub fn execution(&self) -> WorkflowExecution {
        lock(&self.shared).execution.clone()
    }

    pub fn workflow_type(&self) -> String {
        lock(&self.shared).workflow_type.clone()
    }

    pub fn task_queue(&self) -> String {
        lock(&self.shared).task_queue.clone()
    }

    /// The input the run was started with.
    pub fn start_input(&self) -> Option<Payload> {
        lock(&self.shared).start_input.clone()
    }

    /// True while the decider is reconstructing state from history. No
    /// externally visible side effect may happen while this is set, other
    /// than through the marker operations.
    pub fn is_replaying(&self) -> bool {
        lock(&self.shared).replaying
    }

    /// The replay clock: monotone within a run, advanced only by the
    /// decider.
    pub fn current_time_millis(&self) -> i64 {
        lock(&self.shared).current_time_ms
    }

    /// Deterministic UUID: v5 over the run id and a replayed counter.
    /// The n-th call returns the same value on every replay.
    pub fn random_uuid(&self) -> Uuid {
        let mut state = lock(&self.shared);
        let counter = state.uuid_counter;
        state.uuid_counter += 1;
        determinism::deterministic_uuid(&state.execution.run_id, counter)
    }

    /// Deterministic PRNG seeded from the low 64 bits of a [`Self::random_uuid`].
    pub fn new_random(&self) -> StdRng {
        StdRng::seed_from_u64(determinism::uuid_seed(&self.random_uuid()))
    }

    /// The per-run randomness seed derived from the run id at start.
    pub fn random_seed(&self) -> u64 {
        lock(&self.shared).random_seed
    }

    pub fn is_cancel_requested(&self) -> bool {
        lock(&self.shared).cancel_requested
    }

    /// Resolves when (or immediately if) cancellation of this run is
    /// requested. The payload carries the encoded reason when one exists.
    pub fn cancelled(&self) -> WfFuture {
        let mut state = lock(&self.shared);
        let handle = state.new_slot();
        if state.cancel_requested {
            let payload = state
                .cancel_reason
                .clone()
                .and_then(|r| Payload::json(&r).ok());
            state.resolve_slot(handle, Ok(payload));
        } else {
            state.cancel_waiters.push(handle);
        }
        WfFuture {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Schedule a server-dispatched activity.
    pub fn activity(
        &self,
        activity_type: impl Into<String>,
        input: Option<Payload>,
        options: ActivityOptions,
    ) -> ActivityHandle {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::ScheduleActivity {
            seq,
            activity_type: activity_type.into(),
            input,
            options,
            handle,
        });
        ActivityHandle {
            seq,
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Schedule a worker-local activity; its result rides in a marker.
    pub fn local_activity(
        &self,
        activity_type: impl Into<String>,
        input: Option<Payload>,
        options: LocalActivityOptions,
    ) -> LocalActivityHandle {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::ScheduleLocalActivity {
            seq,
            activity_type: activity_type.into(),
            input,
            options,
            handle,
        });
        LocalActivityHandle {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Start a timer firing after `duration_ms`.
    pub fn timer(&self, duration_ms: i64) -> TimerHandle {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::StartTimer {
            seq,
            duration_ms,
            handle,
        });
        TimerHandle {
            seq,
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Suspend for `duration_ms` of workflow time.
    pub async fn sleep(&self, duration_ms: i64) -> Result<(), Failure> {
        self.timer(duration_ms).await.map(|_| ())
    }

    /// Start a child workflow.
    pub fn child_workflow(
        &self,
        workflow_type: impl Into<String>,
        input: Option<Payload>,
        options: ChildWorkflowOptions,
    ) -> ChildWorkflowHandle {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let start_handle = state.new_slot();
        let result_handle = state.new_slot();
        state.ops.push_back(WorkflowOp::StartChildWorkflow {
            seq,
            workflow_type: workflow_type.into(),
            input,
            options,
            start_handle,
            result_handle,
        });
        ChildWorkflowHandle {
            seq,
            start_handle,
            result_handle,
            shared: self.shared.clone(),
        }
    }

    /// Signal another workflow execution.
    pub fn signal_external(
        &self,
        execution: WorkflowExecution,
        signal_name: impl Into<String>,
        input: Option<Payload>,
        child_workflow_only: bool,
    ) -> SignalExternalHandle {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::SignalExternal {
            seq,
            execution,
            signal_name: signal_name.into(),
            input,
            child_workflow_only,
            handle,
        });
        SignalExternalHandle {
            seq,
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Request cancellation of another workflow execution.
    pub fn cancel_external(&self, execution: WorkflowExecution) -> WfFuture {
        let mut state = lock(&self.shared);
        let seq = state.take_seq();
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::RequestCancelExternal {
            seq,
            execution,
            handle,
        });
        WfFuture {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Run `f` once and record its result in a marker; replays return the
    /// recorded value without invoking `f`.
    pub fn side_effect(&self, f: impl FnOnce() -> Payload + Send + 'static) -> WfFuture {
        let mut state = lock(&self.shared);
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::SideEffect {
            func: Box::new(f),
            handle,
        });
        WfFuture {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Keyed side effect: `f` sees the previously stored value and returns
    /// `Some(new)` to record a marker or `None` to keep the stored value.
    pub fn mutable_side_effect(
        &self,
        id: impl Into<String>,
        f: impl FnOnce(Option<&Payload>) -> Option<Payload> + Send + 'static,
    ) -> WfFuture {
        let mut state = lock(&self.shared);
        let handle = state.new_slot();
        state.ops.push_back(WorkflowOp::MutableSideEffect {
            id: id.into(),
            func: Box::new(f),
            handle,
        });
        WfFuture {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Versioned-change gate. Records `max_supported` into a marker the
    /// first time a change id is seen outside replay; replays return the
    /// recorded version, or [`DEFAULT_VERSION`] when history predates the
    /// call.
    pub async fn get_version(
        &self,
        change_id: impl Into<String>,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32, Failure> {
        let fut = {
            let mut state = lock(&self.shared);
            let handle = state.new_slot();
            state.ops.push_back(WorkflowOp::GetVersion {
                change_id: change_id.into(),
                min_supported,
                max_supported,
                handle,
            });
            WfFuture {
                handle,
                shared: self.shared.clone(),
            }
        };
        let payload = fut.await?;
        let payload = payload.ok_or_else(|| Failure::application("get_version lost its value"))?;
        payload
            .decode_json::<i32>()
            .map_err(|e| Failure::application(format!("version payload malformed: {e}")))
    }

    pub fn upsert_search_attributes(
        &self,
        attributes: std::collections::BTreeMap<String, Payload>,
    ) {
        lock(&self.shared)
            .ops
            .push_back(WorkflowOp::UpsertSearchAttributes { attributes });
    }

    /// Named signal stream. Deliveries that arrived before the first call
    /// are buffered and drained in arrival order.
    pub fn signal_channel(&self, name: impl Into<String>) -> SignalChannel {
        SignalChannel {
            name: name.into(),
            shared: self.shared.clone(),
        }
    }

    /// Register a handler answering queries of `query_type` against current
    /// workflow state.
    pub fn register_query_handler(&self, query_type: impl Into<String>, handler: QueryHandler) {
        lock(&self.shared)
            .query_handlers
            .insert(query_type.into(), handler);
    }

    /// Spawn a secondary workflow coroutine. It is scheduled behind every
    /// existing coroutine and participates in the same quiescence rules.
    pub fn spawn(&self, name: impl Into<String>, fut: impl Future<Output = ()> + Send + 'static) {
        lock(&self.shared)
            .spawned
            .push((name.into(), Box::pin(fut)));
    }
}

/// Await side of [`WfContext::activity`]; also the cancel hook.
pub struct ActivityHandle {
    seq: u32,
    handle: FutureHandle,
    shared: Arc<Mutex<WfState>>,
}

impl ActivityHandle {
    /// Request cancellation, honoring the configured cancellation type.
    pub fn cancel(&self) {
        lock(&self.shared)
            .ops
            .push_back(WorkflowOp::CancelActivity { seq: self.seq });
    }
}

impl Future for ActivityHandle {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.handle, cx)
    }
}

/// Await side of [`WfContext::local_activity`]. Local activities cannot be
/// canceled once handed to the worker; there is no cancel hook.
pub struct LocalActivityHandle {
    handle: FutureHandle,
    shared: Arc<Mutex<WfState>>,
}

impl Future for LocalActivityHandle {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.handle, cx)
    }
}

/// Await side of [`WfContext::timer`].
pub struct TimerHandle {
    seq: u32,
    handle: FutureHandle,
    shared: Arc<Mutex<WfState>>,
}

impl TimerHandle {
    /// Cancel the timer. The awaiting coroutine observes the cancellation
    /// within the current task, before any new history event is consumed.
    pub fn cancel(&self) {
        lock(&self.shared)
            .ops
            .push_back(WorkflowOp::CancelTimer { seq: self.seq });
    }
}

impl Future for TimerHandle {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.handle, cx)
    }
}

/// Handle to a started child workflow: separate futures for the start
/// acknowledgement and the terminal result, plus the cancel hook.
pub struct ChildWorkflowHandle {
    seq: u32,
    start_handle: FutureHandle,
    result_handle: FutureHandle,
    shared: Arc<Mutex<WfState>>,
}

impl ChildWorkflowHandle {
    /// Resolves when the child actually starts (payload: encoded run id),
    /// or with the start failure.
    pub fn start_result(&self) -> WfFuture {
        WfFuture {
            handle: self.start_handle,
            shared: self.shared.clone(),
        }
    }

    /// Resolves with the child's terminal outcome.
    pub fn result(&self) -> WfFuture {
        WfFuture {
            handle: self.result_handle,
            shared: self.shared.clone(),
        }
    }

    /// Cancel per the configured [`ChildWorkflowCancellationType`]
    /// (windward_types::ChildWorkflowCancellationType).
    pub fn cancel(&self) {
        lock(&self.shared)
            .ops
            .push_back(WorkflowOp::CancelChildWorkflow { seq: self.seq });
    }
}

impl Future for ChildWorkflowHandle {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.result_handle, cx)
    }
}

/// Await side of [`WfContext::signal_external`]; cancel collapses the
/// machine with no network effect when the signal was not yet sent.
pub struct SignalExternalHandle {
    seq: u32,
    handle: FutureHandle,
    shared: Arc<Mutex<WfState>>,
}

impl SignalExternalHandle {
    pub fn cancel(&self) {
        lock(&self.shared)
            .ops
            .push_back(WorkflowOp::CancelSignalExternal { seq: self.seq });
    }
}

impl Future for SignalExternalHandle {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.handle, cx)
    }
}

/// Drainable stream of one signal name's deliveries.
pub struct SignalChannel {
    name: String,
    shared: Arc<Mutex<WfState>>,
}

impl SignalChannel {
    /// The next delivery: an already-buffered one, or a future delivery in
    /// arrival order behind earlier waiters.
    pub fn next(&self) -> WfFuture {
        let mut state = lock(&self.shared);
        let handle = state.new_slot();
        let queued = state
            .signals
            .entry(self.name.clone())
            .or_default()
            .queued
            .pop_front();
        match queued {
            Some(input) => state.resolve_slot(handle, Ok(input)),
            None => state
                .signals
                .get_mut(&self.name)
                .expect("buffer just inserted")
                .waiters
                .push_back(handle),
        }
        WfFuture {
            handle,
            shared: self.shared.clone(),
        }
    }
}
