//! The worker process: pollers, bounded dispatch, and per-run
//! serialization.
//!
//! Multiple pollers long-poll the service for workflow and activity tasks.
//! Activity tasks fan out freely under their semaphore; workflow tasks
//! additionally serialize per run id so at most one task per run is in
//! flight. A workflow task that misses the decider cache (partial history,
//! cold worker) is retried once against the full history.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use windward_decider::{
    DeciderCache, DeciderConfig, DeciderError, WorkflowTaskExecutor,
};
use windward_types::task::{WorkflowTask, WorkflowTaskResponse};

use crate::activity::{ActivityFn, ActivityRegistry, ActivityTaskHandler};
use crate::service::{
    RespondQueryTaskCompletedRequest, RespondWorkflowTaskCompletedRequest,
    RespondWorkflowTaskFailedRequest, ServiceResult, WorkflowService,
};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub task_queue: String,
    /// Enables sticky execution when set; completions advertise this queue.
    pub sticky_queue: Option<String>,
    pub max_cached_workflows: usize,
    pub max_concurrent_workflow_tasks: usize,
    pub max_concurrent_activities: usize,
    pub workflow_pollers: usize,
    pub activity_pollers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: "default".to_string(),
            sticky_queue: None,
            max_cached_workflows: 600,
            max_concurrent_workflow_tasks: 100,
            max_concurrent_activities: 100,
            workflow_pollers: 2,
            activity_pollers: 5,
        }
    }
}

/// Serializes workflow tasks per run id.
#[derive(Default)]
struct RunLocks {
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RunLocks {
    async fn for_run(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct Worker {
    service: Arc<dyn WorkflowService>,
    config: WorkerConfig,
    cache: Arc<DeciderCache>,
    executor: WorkflowTaskExecutor,
    activities: ActivityRegistry,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        service: Arc<dyn WorkflowService>,
        config: WorkerConfig,
        decider_config: DeciderConfig,
    ) -> Self {
        let cache = Arc::new(DeciderCache::new(config.max_cached_workflows));
        let mut executor = WorkflowTaskExecutor::new(cache.clone(), decider_config);
        if let Some(sticky) = &config.sticky_queue {
            executor.set_sticky_queue(sticky.clone());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            service,
            config,
            cache,
            executor,
            activities: ActivityRegistry::default(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn register_workflow(
        &mut self,
        workflow_type: impl Into<String>,
        f: windward_decider::WorkflowFunction,
    ) {
        self.executor.register_workflow(workflow_type, f);
    }

    pub fn register_activity(&mut self, activity_type: impl Into<String>, f: ActivityFn) {
        self.activities.register(activity_type, f);
    }

    pub fn register_local_activity(
        &mut self,
        activity_type: impl Into<String>,
        f: windward_decider::LocalActivityFn,
    ) {
        self.executor.register_local_activity(activity_type, f);
    }

    /// Handle for stopping a running worker.
    pub fn shutdown_handle(&self) -> WorkerShutdownHandle {
        WorkerShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run pollers and dispatch until shut down.
    pub async fn run(self) -> ServiceResult<()> {
        info!(task_queue = %self.config.task_queue, "worker starting");
        let activity_handler = Arc::new(ActivityTaskHandler::new(
            self.service.clone(),
            self.activities.clone(),
        ));
        let workflow_permits = Arc::new(Semaphore::new(self.config.max_concurrent_workflow_tasks));
        let activity_permits = Arc::new(Semaphore::new(self.config.max_concurrent_activities));
        let worker = Arc::new(WorkerInner {
            service: self.service,
            config: self.config,
            cache: self.cache,
            executor: Arc::new(self.executor),
            activity_handler,
            run_locks: RunLocks::default(),
            workflow_permits,
            activity_permits,
        });
        worker.run(self.shutdown_rx).await
    }
}

/// Stops the worker's poll loops. In-flight tasks finish first.
#[derive(Clone)]
pub struct WorkerShutdownHandle {
    tx: watch::Sender<bool>,
}

impl WorkerShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

struct WorkerInner {
    service: Arc<dyn WorkflowService>,
    config: WorkerConfig,
    cache: Arc<DeciderCache>,
    executor: Arc<WorkflowTaskExecutor>,
    activity_handler: Arc<ActivityTaskHandler>,
    run_locks: RunLocks,
    workflow_permits: Arc<Semaphore>,
    activity_permits: Arc<Semaphore>,
}

impl WorkerInner {
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> ServiceResult<()> {
        let mut join_set = JoinSet::new();
        for _ in 0..self.config.workflow_pollers {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move { worker.workflow_poll_loop(shutdown).await });
        }
        for _ in 0..self.config.activity_pollers {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move { worker.activity_poll_loop(shutdown).await });
        }
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "poller exited with error");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "poller panicked"),
            }
        }
        info!("worker stopped");
        Ok(())
    }

    async fn workflow_poll_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServiceResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let polled = tokio::select! {
                polled = self.service.poll_workflow_task(&self.config.task_queue) => polled?,
                _ = shutdown.changed() => continue,
            };
            let Some(task) = polled else {
                continue;
            };
            // Saturated dispatch pool: reclaim memory from idle runs before
            // waiting for a slot.
            if self.workflow_permits.available_permits() == 0 {
                self.cache
                    .evict_any_not_in_processing(&task.execution.run_id);
            }
            let permit = self
                .workflow_permits
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.process_workflow_task(task).await {
                    warn!(error = %e, "workflow task processing failed");
                }
            });
        }
    }

    async fn activity_poll_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServiceResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let polled = tokio::select! {
                polled = self.service.poll_activity_task(&self.config.task_queue) => polled?,
                _ = shutdown.changed() => continue,
            };
            let Some(task) = polled else {
                continue;
            };
            let permit = self
                .activity_permits
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let handler = self.activity_handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.handle(task).await {
                    warn!(error = %e, "activity task processing failed");
                }
            });
        }
    }

    async fn process_workflow_task(&self, mut task: WorkflowTask) -> ServiceResult<()> {
        let run_lock = self.run_locks.for_run(&task.execution.run_id).await;
        let _run_guard = run_lock.lock().await;

        let mut refetched = false;
        loop {
            match self.executor.handle_workflow_task(&task).await {
                Ok(response) => return self.respond(&task, response).await,
                Err(DeciderError::CacheMiss) if !refetched => {
                    debug!(
                        run_id = %task.execution.run_id,
                        "sticky cache miss; refetching full history"
                    );
                    task.history = self
                        .service
                        .get_workflow_history(task.execution.clone())
                        .await?;
                    refetched = true;
                }
                Err(e) => {
                    warn!(run_id = %task.execution.run_id, error = %e, "abandoning workflow task");
                    return Ok(());
                }
            }
        }
    }

    async fn respond(
        &self,
        task: &WorkflowTask,
        response: WorkflowTaskResponse,
    ) -> ServiceResult<()> {
        match response {
            WorkflowTaskResponse::Completed {
                commands,
                force_new_task,
                sticky_queue,
            } => {
                self.service
                    .respond_workflow_task_completed(RespondWorkflowTaskCompletedRequest {
                        task_token: task.task_token.clone(),
                        commands,
                        force_create_new_task: force_new_task,
                        sticky_queue,
                    })
                    .await
            }
            WorkflowTaskResponse::Failed { cause, failure } => {
                self.service
                    .respond_workflow_task_failed(RespondWorkflowTaskFailedRequest {
                        task_token: task.task_token.clone(),
                        cause,
                        failure,
                    })
                    .await
            }
            WorkflowTaskResponse::QueryCompleted { result } => {
                self.service
                    .respond_query_task_completed(RespondQueryTaskCompletedRequest {
                        task_token: task.task_token.clone(),
                        result,
                    })
                    .await
            }
        }
    }
}
