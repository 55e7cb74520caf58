//! Per-run state shared between the decider and the workflow coroutines.
//!
//! Workflow code never touches the decider directly: every operation it
//! performs is pushed here as a [`WorkflowOp`] and materialized by the
//! decider between runner passes. That keeps the object graph acyclic
//! (coroutines hold only this state; the decider owns everything else) and
//! makes the drain point the single place where commands come into being,
//! in creation order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use windward_types::{
    ActivityOptions, ChildWorkflowOptions, ContinueAsNewAttributes, Failure, LocalActivityOptions,
    Payload, WorkflowExecution,
};

use crate::futures::{FutureHandle, FutureSlot, OpResult};

/// Answer a query against current workflow state. Runs outside history;
/// must not perform operations.
pub type QueryHandler = Box<dyn Fn(Option<Payload>) -> Result<Payload, Failure> + Send>;

/// How the workflow's root coroutine finished.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowExitValue {
    /// Normal return with an optional result payload.
    Normal(Option<Payload>),
    /// Restart the workflow as a new run.
    ContinueAsNew(ContinueAsNewAttributes),
    /// The workflow acknowledged a cancellation request.
    Canceled,
}

pub type WorkflowResult = Result<WorkflowExitValue, Failure>;

/// Buffered signal deliveries and the coroutines waiting on them, per
/// signal name. Signals that arrive before any waiter registers queue up
/// and drain in arrival order.
#[derive(Default)]
pub(crate) struct SignalBuffer {
    pub(crate) queued: VecDeque<Option<Payload>>,
    pub(crate) waiters: VecDeque<FutureHandle>,
}

/// An operation requested by workflow code, drained by the decider after
/// each runner pass.
pub(crate) enum WorkflowOp {
    ScheduleActivity {
        seq: u32,
        activity_type: String,
        input: Option<Payload>,
        options: ActivityOptions,
        handle: FutureHandle,
    },
    CancelActivity {
        seq: u32,
    },
    StartTimer {
        seq: u32,
        duration_ms: i64,
        handle: FutureHandle,
    },
    CancelTimer {
        seq: u32,
    },
    StartChildWorkflow {
        seq: u32,
        workflow_type: String,
        input: Option<Payload>,
        options: ChildWorkflowOptions,
        start_handle: FutureHandle,
        result_handle: FutureHandle,
    },
    CancelChildWorkflow {
        seq: u32,
    },
    SignalExternal {
        seq: u32,
        execution: WorkflowExecution,
        signal_name: String,
        input: Option<Payload>,
        child_workflow_only: bool,
        handle: FutureHandle,
    },
    CancelSignalExternal {
        seq: u32,
    },
    RequestCancelExternal {
        seq: u32,
        execution: WorkflowExecution,
        handle: FutureHandle,
    },
    ScheduleLocalActivity {
        seq: u32,
        activity_type: String,
        input: Option<Payload>,
        options: LocalActivityOptions,
        handle: FutureHandle,
    },
    SideEffect {
        func: Box<dyn FnOnce() -> Payload + Send>,
        handle: FutureHandle,
    },
    MutableSideEffect {
        id: String,
        func: Box<dyn FnOnce(Option<&Payload>) -> Option<Payload> + Send>,
        handle: FutureHandle,
    },
    GetVersion {
        change_id: String,
        min_supported: i32,
        max_supported: i32,
        handle: FutureHandle,
    },
    UpsertSearchAttributes {
        attributes: BTreeMap<String, Payload>,
    },
}

impl WorkflowOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "ScheduleActivity",
            Self::CancelActivity { .. } => "CancelActivity",
            Self::StartTimer { .. } => "StartTimer",
            Self::CancelTimer { .. } => "CancelTimer",
            Self::StartChildWorkflow { .. } => "StartChildWorkflow",
            Self::CancelChildWorkflow { .. } => "CancelChildWorkflow",
            Self::SignalExternal { .. } => "SignalExternal",
            Self::CancelSignalExternal { .. } => "CancelSignalExternal",
            Self::RequestCancelExternal { .. } => "RequestCancelExternal",
            Self::ScheduleLocalActivity { .. } => "ScheduleLocalActivity",
            Self::SideEffect { .. } => "SideEffect",
            Self::MutableSideEffect { .. } => "MutableSideEffect",
            Self::GetVersion { .. } => "GetVersion",
            Self::UpsertSearchAttributes { .. } => "UpsertSearchAttributes",
        }
    }
}

/// The state a run's coroutines can see. One instance per run, behind a
/// mutex so the decider stays `Send` for the cache.
pub(crate) struct WfState {
    pub(crate) execution: WorkflowExecution,
    pub(crate) workflow_type: String,
    pub(crate) task_queue: String,
    pub(crate) workflow_task_timeout_ms: i64,
    /// Input recorded in the run's `WorkflowStarted` event.
    pub(crate) start_input: Option<Payload>,

    pub(crate) replaying: bool,
    /// Monotone replay clock in epoch millis.
    pub(crate) current_time_ms: i64,
    pub(crate) random_seed: u64,
    /// Counter behind `random_uuid()`. Part of replayed state.
    pub(crate) uuid_counter: u32,
    /// Single sequence shared by every operation kind; doubles as the
    /// default string id for timers and activities.
    pub(crate) next_seq: u32,

    pub(crate) slots: Vec<FutureSlot>,
    pub(crate) ops: VecDeque<WorkflowOp>,
    pub(crate) signals: HashMap<String, SignalBuffer>,

    pub(crate) cancel_requested: bool,
    pub(crate) cancel_reason: Option<String>,
    pub(crate) cancel_waiters: Vec<FutureHandle>,

    pub(crate) query_handlers: HashMap<String, QueryHandler>,
    /// Coroutines spawned by workflow code, pending adoption by the runner.
    pub(crate) spawned: Vec<(String, BoxFuture<'static, ()>)>,
    /// Set once when the root coroutine returns.
    pub(crate) main_result: Option<WorkflowResult>,
}

impl WfState {
    pub(crate) fn new(execution: WorkflowExecution, workflow_type: String, seed: u64) -> Self {
        Self {
            execution,
            workflow_type,
            task_queue: String::new(),
            workflow_task_timeout_ms: 10_000,
            start_input: None,
            replaying: false,
            current_time_ms: 0,
            random_seed: seed,
            uuid_counter: 0,
            next_seq: 0,
            slots: Vec::new(),
            ops: VecDeque::new(),
            signals: HashMap::new(),
            cancel_requested: false,
            cancel_reason: None,
            cancel_waiters: Vec::new(),
            query_handlers: HashMap::new(),
            spawned: Vec::new(),
            main_result: None,
        }
    }

    pub(crate) fn new_slot(&mut self) -> FutureHandle {
        self.slots.push(FutureSlot::pending());
        self.slots.len() - 1
    }

    pub(crate) fn resolve_slot(&mut self, handle: FutureHandle, result: OpResult) {
        self.slots[handle].resolve(result);
    }

    /// Allocate the next operation sequence number. Deterministic because
    /// workflow code runs single-threaded in a fixed order.
    pub(crate) fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Deliver an inbound signal: hand it to the oldest waiter, or buffer
    /// it for a waiter yet to register.
    pub(crate) fn deliver_signal(&mut self, name: &str, input: Option<Payload>) {
        let buffer = self.signals.entry(name.to_string()).or_default();
        if let Some(waiter) = buffer.waiters.pop_front() {
            self.slots[waiter].resolve(Ok(input));
        } else {
            buffer.queued.push_back(input);
        }
    }

    /// Flag cooperative cancellation and wake everything waiting on it.
    pub(crate) fn request_cancel(&mut self, reason: Option<String>) {
        self.cancel_requested = true;
        self.cancel_reason = reason.clone();
        let payload = reason.and_then(|r| Payload::json(&r).ok());
        for waiter in std::mem::take(&mut self.cancel_waiters) {
            self.slots[waiter].resolve(Ok(payload.clone()));
        }
    }
}

/// Lock helper shared by the context and decider sides.
pub(crate) fn lock(shared: &Arc<Mutex<WfState>>) -> MutexGuard<'_, WfState> {
    shared.lock().expect("workflow state lock")
}
