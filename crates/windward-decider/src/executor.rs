//! Public entry point: turn one inbound workflow task into a response.
//!
//! Loads or creates the run's decider through the cache, applies the
//! task's history, drives queued local activities to quiescence, and
//! assembles the outbound commands or query answer. Decider errors other
//! than a cache miss are converted into task-failed responses here; a
//! cache miss propagates so the worker can refetch full history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use windward_types::task::{WorkflowTask, WorkflowTaskFailedCause, WorkflowTaskResponse};
use windward_types::{Failure, FailureKind};

use crate::cache::DeciderCache;
use crate::context::WorkflowFunction;
use crate::decider::{Decider, DeciderConfig, TaskDecisions};
use crate::error::DeciderError;
use crate::local_activity::{
    LocalActivityOutcome, LocalActivityRegistry, run_local_activity,
};

/// Executes workflow tasks for the workflow types registered on a worker.
pub struct WorkflowTaskExecutor {
    cache: Arc<DeciderCache>,
    config: DeciderConfig,
    workflows: HashMap<String, WorkflowFunction>,
    local_activities: LocalActivityRegistry,
    sticky_queue: Option<String>,
}

impl WorkflowTaskExecutor {
    pub fn new(cache: Arc<DeciderCache>, config: DeciderConfig) -> Self {
        Self {
            cache,
            config,
            workflows: HashMap::new(),
            local_activities: LocalActivityRegistry::default(),
            sticky_queue: None,
        }
    }

    pub fn register_workflow(&mut self, workflow_type: impl Into<String>, f: WorkflowFunction) {
        self.workflows.insert(workflow_type.into(), f);
    }

    pub fn register_local_activity(
        &mut self,
        activity_type: impl Into<String>,
        f: crate::local_activity::LocalActivityFn,
    ) {
        self.local_activities.register(activity_type, f);
    }

    /// Queue name advertised in completions so the server routes this
    /// run's next task back to the warm decider.
    pub fn set_sticky_queue(&mut self, queue: impl Into<String>) {
        self.sticky_queue = Some(queue.into());
    }

    /// Handle one workflow task end to end.
    ///
    /// `Err` carries only [`DeciderError::CacheMiss`]; every other failure
    /// becomes a task-failed (or query-failed) response.
    pub async fn handle_workflow_task(
        &self,
        task: &WorkflowTask,
    ) -> Result<WorkflowTaskResponse, DeciderError> {
        let run_id = task.execution.run_id.clone();
        let Some(workflow_fn) = self.workflows.get(&task.workflow_type).cloned() else {
            return Ok(WorkflowTaskResponse::Failed {
                cause: WorkflowTaskFailedCause::WorkflowError,
                failure: Failure::application(format!(
                    "workflow type {} is not registered on this worker",
                    task.workflow_type
                )),
            });
        };

        let mut decider = self.cache.get_or_create(task, || {
            Decider::new(
                task.execution.clone(),
                task.workflow_type.clone(),
                workflow_fn,
                self.config.clone(),
            )
        })?;

        let driven = self.drive(&mut decider, task).await;
        let response = match driven {
            Ok(decisions) => {
                if let Some(query) = &task.query {
                    let result = decider
                        .answer_query(query)
                        .map_err(|f| f.to_string());
                    self.park(decider, &run_id);
                    return Ok(WorkflowTaskResponse::QueryCompleted { result });
                }
                let TaskDecisions {
                    commands,
                    force_new_task,
                } = decisions;
                debug!(
                    run_id = %run_id,
                    commands = commands.len(),
                    force_new_task,
                    "workflow task completed"
                );
                self.park(decider, &run_id);
                WorkflowTaskResponse::Completed {
                    commands,
                    force_new_task,
                    sticky_queue: self.sticky_queue.clone(),
                }
            }
            Err(DeciderError::CacheMiss) => {
                self.discard(decider, &run_id);
                return Err(DeciderError::CacheMiss);
            }
            Err(DeciderError::WorkflowTaskFailure(failure)) => {
                warn!(run_id = %run_id, error = %failure, "workflow task failed by policy");
                self.discard(decider, &run_id);
                WorkflowTaskResponse::Failed {
                    cause: WorkflowTaskFailedCause::WorkflowError,
                    failure,
                }
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "workflow task failed");
                self.discard(decider, &run_id);
                WorkflowTaskResponse::Failed {
                    cause: WorkflowTaskFailedCause::NonDeterminism,
                    failure: Failure::new(FailureKind::NonDeterminism, e.to_string()),
                }
            }
        };
        Ok(response)
    }

    /// Apply history, then alternate local-activity execution with
    /// workflow progress until no more local activities are queued.
    async fn drive(
        &self,
        decider: &mut Decider,
        task: &WorkflowTask,
    ) -> Result<TaskDecisions, DeciderError> {
        decider.apply_history(task)?;
        let budget_ms = decider.workflow_task_timeout_ms();

        loop {
            let requests = decider.take_pending_local_activities();
            if requests.is_empty() {
                break;
            }
            for request in requests {
                let outcome = match self.local_activities.get(&request.activity_type) {
                    Some(f) => run_local_activity(&request, f, budget_ms).await,
                    None => LocalActivityOutcome::Failed {
                        failure: Failure::application(format!(
                            "local activity type {} is not registered on this worker",
                            request.activity_type
                        )),
                        attempt: request.attempt,
                    },
                };
                decider.apply_local_activity_resolution(
                    &request,
                    outcome,
                    Utc::now().timestamp_millis(),
                )?;
            }
        }
        decider.finalize()
    }

    /// Return a healthy decider to the cache, or tear it down when the run
    /// reached a terminal state.
    fn park(&self, decider: Decider, run_id: &str) {
        if decider.workflow_finished() {
            let mut decider = decider;
            decider.close();
        } else {
            self.cache.add_to_cache(run_id, decider);
        }
        self.cache.mark_processing_done(run_id);
    }

    fn discard(&self, mut decider: Decider, run_id: &str) {
        decider.close();
        self.cache.invalidate(run_id);
        self.cache.mark_processing_done(run_id);
    }
}
