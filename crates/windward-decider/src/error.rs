use windward_types::Failure;

/// Errors produced while driving a run's history through the decider.
#[derive(Debug, thiserror::Error)]
pub enum DeciderError {
    /// Command/event mismatch during replay, an unknown state machine, or a
    /// malformed history. Fatal to the workflow task; reported to the server
    /// as task-failed so the sticky queue resets.
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),

    /// Invariant breakage inside the decider itself.
    #[error("fatal decider error: {0}")]
    Fatal(String),

    /// Partial history arrived but the run is no longer cached. The worker
    /// must refetch the full history and rebuild.
    #[error("partial history for a run that is no longer cached")]
    CacheMiss,

    #[error("history is empty")]
    EmptyHistory,

    /// Workflow code raised a failure configured to fail the current task
    /// instead of the workflow execution.
    #[error("workflow task failed by policy: {0}")]
    WorkflowTaskFailure(Failure),
}
