pub mod command;
pub mod event;
pub mod execution;
pub mod failure;
pub mod marker;
pub mod options;
pub mod payload;
pub mod task;

pub use command::{
    Command, ContinueAsNewAttributes, FORCE_IMMEDIATE_DECISION_TIMER_ID,
    RequestCancelExternalAttributes, ScheduleActivityAttributes, SignalExternalAttributes,
    StartChildWorkflowAttributes, StartTimerAttributes,
};
pub use event::{EventAttributes, HistoryEvent};
pub use execution::{WorkflowExecution, run_id_seed};
pub use failure::{Failure, FailureKind, TimeoutKind};
pub use marker::{
    LOCAL_ACTIVITY_MARKER_NAME, LocalActivityMarkerData, MUTABLE_SIDE_EFFECT_MARKER_NAME,
    MarkerData, MutableMarkerHeader, SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};
pub use options::{
    ActivityCancellationType, ActivityOptions, ChildWorkflowCancellationType,
    ChildWorkflowOptions, ContinueAsNewOptions, LocalActivityOptions, OptionsError,
    ParentClosePolicy, RetryPolicy, WorkflowIdReusePolicy, round_up_to_seconds,
};
pub use payload::{Codec, Payload};
pub use task::{
    ActivityTask, QueryInput, WorkflowTask, WorkflowTaskFailedCause, WorkflowTaskResponse,
};
