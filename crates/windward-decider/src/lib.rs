//! Client-side replay engine for durable workflows.
//!
//! Reconstructs a run's in-memory state from its append-only event
//! history, drives user workflow code on a deterministic cooperative
//! scheduler, and emits the commands the workflow wants executed next.
//! Replay of the same history with the same code always yields the same
//! command stream; any divergence is surfaced as a non-determinism error.

pub mod cache;
pub mod context;
pub mod decider;
pub mod error;
pub mod executor;
pub mod futures;
pub mod history;
pub mod local_activity;
pub mod testing;

mod determinism;
mod machines;
mod markers;
mod runner;
mod state;

pub use cache::DeciderCache;
pub use context::{
    ActivityHandle, ChildWorkflowHandle, DEFAULT_VERSION, LocalActivityHandle, SignalChannel,
    SignalExternalHandle, TimerHandle, WfContext, WorkflowFunction, workflow_fn,
};
pub use decider::{Decider, DeciderConfig, TaskDecisions};
pub use error::DeciderError;
pub use executor::WorkflowTaskExecutor;
pub use futures::{OpResult, WfFuture};
pub use history::{HistorySlices, WorkflowTaskSlice};
pub use local_activity::{
    LocalActivityFn, LocalActivityOutcome, LocalActivityRegistry, LocalActivityRequest,
    local_activity_fn, run_local_activity,
};
pub use state::{QueryHandler, WorkflowExitValue, WorkflowResult};
