//! The per-run decider: replays history into state, drives the workflow
//! coroutines, and emits commands.
//!
//! One instance exists per currently executing (or cached) run. A workflow
//! task is processed slice by slice; within a slice the order is fixed:
//! marker pre-cache, event delivery, coroutine event loop, terminal
//! command synthesis, command flush, and finally FIFO matching of the
//! slice's command records against the buffer. Any mismatch in that last
//! step is non-determinism and fatal to the task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument, warn};

use windward_types::command::{Command, StartTimerAttributes};
use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::marker::LocalActivityMarkerData;
use windward_types::task::WorkflowTask;
use windward_types::{
    FORCE_IMMEDIATE_DECISION_TIMER_ID, Failure, FailureKind, Payload, QueryInput,
    ScheduleActivityAttributes, StartChildWorkflowAttributes, WorkflowExecution, round_up_to_seconds,
    run_id_seed,
};

use crate::context::WfContext;
use crate::context::WorkflowFunction;
use crate::error::DeciderError;
use crate::futures::OpResult;
use crate::history::{HistorySlices, WorkflowTaskSlice};
use crate::local_activity::LocalActivityRequest;
use crate::machines::{
    Machine, MachineAction, MachineKey, MachineKind, MachineState, MachineTable, activity,
    child_workflow, external, local_activity as la_machine, marker as marker_machine, timer,
    workflow_self, workflow_task,
};
use crate::markers::{self, MarkerHandler};
use crate::runner::DeterministicRunner;
use crate::state::{WfState, WorkflowExitValue, WorkflowOp, lock};

/// Server-imposed ceiling on commands per workflow task completion.
pub(crate) const MAX_COMMANDS_PER_TASK: usize = 10_000;

/// Workflow-author-visible ids, mapping operation sequence numbers to
/// machines for cancellation requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum CommandId {
    Activity(u32),
    Timer(u32),
    Child(u32),
    SignalExternal(u32),
    CancelExternal(u32),
    LocalActivity(u32),
}

struct PendingCommand {
    command: Command,
    machine: MachineKey,
    /// Whether this command has been included in a flush toward the
    /// server. An event arriving for an unsent command is non-determinism.
    sent: bool,
}

/// Knobs that change decider behavior per worker.
#[derive(Clone, Debug, Default)]
pub struct DeciderConfig {
    /// Failure kinds from workflow code that fail the current task (and so
    /// retry after a fix is deployed) instead of failing the workflow.
    pub fail_workflow_task_on: Vec<FailureKind>,
}

/// What one fully processed workflow task wants sent back to the server.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDecisions {
    pub commands: Vec<Command>,
    pub force_new_task: bool,
}

struct DeferredLocalActivity {
    request: LocalActivityRequest,
}

pub struct Decider {
    execution: WorkflowExecution,
    config: DeciderConfig,
    workflow_fn: WorkflowFunction,

    shared: Arc<Mutex<WfState>>,
    runner: DeterministicRunner,
    machines: MachineTable,
    machines_by_event_id: HashMap<i64, MachineKey>,
    id_to_machine: HashMap<CommandId, MachineKey>,
    la_machines_by_id: HashMap<String, MachineKey>,

    /// Commands awaiting their history record, in creation order.
    commands: VecDeque<PendingCommand>,

    marker_handler: MarkerHandler,
    /// Local-activity markers seen before their schedule call replayed.
    la_recorded: HashMap<String, VecDeque<LocalActivityMarkerData>>,
    la_pending: Vec<LocalActivityRequest>,
    la_deferred: Vec<DeferredLocalActivity>,

    /// The current slice's command records, for positional marker peeks.
    replay_command_events: Vec<HistoryEvent>,
    slice_base_event_id: i64,
    slice_commands_created: i64,

    current_started_event_id: i64,
    started: bool,
    terminal_issued: bool,
    have_seen_terminal_event: bool,
    force_new_task: bool,
}

impl Decider {
    pub fn new(
        execution: WorkflowExecution,
        workflow_type: impl Into<String>,
        workflow_fn: WorkflowFunction,
        config: DeciderConfig,
    ) -> Self {
        let seed = run_id_seed(&execution.run_id);
        let shared = Arc::new(Mutex::new(WfState::new(
            execution.clone(),
            workflow_type.into(),
            seed,
        )));
        Self {
            execution,
            config,
            workflow_fn,
            shared,
            runner: DeterministicRunner::default(),
            machines: MachineTable::default(),
            machines_by_event_id: HashMap::new(),
            id_to_machine: HashMap::new(),
            la_machines_by_id: HashMap::new(),
            commands: VecDeque::new(),
            marker_handler: MarkerHandler::default(),
            la_recorded: HashMap::new(),
            la_pending: Vec::new(),
            la_deferred: Vec::new(),
            replay_command_events: Vec::new(),
            slice_base_event_id: 0,
            slice_commands_created: 0,
            current_started_event_id: 0,
            started: false,
            terminal_issued: false,
            have_seen_terminal_event: false,
            force_new_task: false,
        }
    }

    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Budget for in-task local activity retries, from the run's start
    /// event.
    pub fn workflow_task_timeout_ms(&self) -> i64 {
        lock(&self.shared).workflow_task_timeout_ms
    }

    /// Whether the run has reached a terminal event or issued a terminal
    /// command.
    pub fn workflow_finished(&self) -> bool {
        self.terminal_issued || self.have_seen_terminal_event
    }

    /// Free the run's coroutines. Called on cache eviction.
    pub fn close(&mut self) {
        self.runner.clear();
    }

    /// Apply one inbound workflow task's history. Local activities the
    /// workflow scheduled are queued; the executor drives them and calls
    /// [`Self::finalize`] when the task has quiesced.
    #[instrument(level = "debug", skip(self, task), fields(run_id = %task.execution.run_id))]
    pub fn apply_history(&mut self, task: &WorkflowTask) -> Result<(), DeciderError> {
        if !self.started && !task.starts_at_history_begin() {
            return Err(DeciderError::CacheMiss);
        }
        lock(&self.shared).replaying = task.previous_started_event_id > 0;

        let mut slices = HistorySlices::new(&task.history)?;
        while let Some(slice) = slices.next_slice()? {
            self.apply_slice(slice)?;
        }
        Ok(())
    }

    /// Take the local activities queued for execution this task.
    pub fn take_pending_local_activities(&mut self) -> Vec<LocalActivityRequest> {
        std::mem::take(&mut self.la_pending)
    }

    /// Feed back the outcome of one local activity execution and run the
    /// workflow forward on it.
    pub fn apply_local_activity_resolution(
        &mut self,
        request: &LocalActivityRequest,
        outcome: crate::local_activity::LocalActivityOutcome,
        now_ms: i64,
    ) -> Result<(), DeciderError> {
        use crate::local_activity::LocalActivityOutcome::*;
        let key = *self
            .la_machines_by_id
            .get(&request.activity_id)
            .ok_or_else(|| {
                DeciderError::Fatal(format!(
                    "resolution for unknown local activity {}",
                    request.activity_id
                ))
            })?;

        let marker = match &outcome {
            Completed { result, attempt } => LocalActivityMarkerData {
                activity_id: request.activity_id.clone(),
                activity_type: request.activity_type.clone(),
                attempt: *attempt,
                backoff_ms: None,
                replay_time_ms: now_ms,
                result: result.clone(),
                failure: None,
            },
            Failed { failure, attempt } => LocalActivityMarkerData {
                activity_id: request.activity_id.clone(),
                activity_type: request.activity_type.clone(),
                attempt: *attempt,
                backoff_ms: None,
                replay_time_ms: now_ms,
                result: None,
                failure: Some(failure.clone()),
            },
            Deferred {
                failure,
                attempt,
                backoff_ms,
            } => LocalActivityMarkerData {
                activity_id: request.activity_id.clone(),
                activity_type: request.activity_type.clone(),
                attempt: *attempt,
                backoff_ms: Some(*backoff_ms),
                replay_time_ms: now_ms,
                result: None,
                failure: Some(failure.clone()),
            },
        };
        self.apply_local_activity_marker(key, marker)?;
        self.event_loop()?;
        self.maybe_complete_workflow()
    }

    /// Assemble the outbound command set for the freshest task.
    pub fn finalize(&mut self) -> Result<TaskDecisions, DeciderError> {
        let commands = self.flush_commands();
        Ok(TaskDecisions {
            commands,
            force_new_task: std::mem::take(&mut self.force_new_task),
        })
    }

    /// Answer a legacy query against current workflow state.
    pub fn answer_query(&self, query: &QueryInput) -> Result<Payload, Failure> {
        let state = lock(&self.shared);
        match state.query_handlers.get(&query.query_type) {
            Some(handler) => handler(query.args.clone()),
            None => Err(Failure::application(format!(
                "unknown query type {}",
                query.query_type
            ))),
        }
    }

    /// Machines still awaiting an obligation; zero once a run's history is
    /// fully consumed (command/event pairing property).
    pub fn open_machine_count(&self) -> usize {
        self.machines.non_final_count()
    }

    // ── slice processing ──

    fn apply_slice(&mut self, slice: WorkflowTaskSlice) -> Result<(), DeciderError> {
        debug!(
            events = slice.events.len(),
            command_events = slice.command_events.len(),
            replay = slice.replay,
            next_command_event_id = slice.next_command_event_id,
            "applying workflow task slice"
        );
        {
            let mut state = lock(&self.shared);
            state.replaying = slice.replay;
            if slice.replay_time_ms > state.current_time_ms {
                state.current_time_ms = slice.replay_time_ms;
            }
        }
        self.slice_base_event_id = slice.next_command_event_id;
        self.slice_commands_created = 0;
        self.replay_command_events = slice.command_events.clone();

        // Markers first: their data must be in place before the event loop
        // replays the calls that consume it.
        for event in &slice.command_events {
            self.marker_handler.cache_marker(event);
            if let Some(la) = markers::as_local_activity_marker(event) {
                self.note_local_activity_marker(la)?;
            }
        }

        for event in &slice.events {
            self.handle_event(event)?;
        }

        if !slice.replay {
            self.resubmit_deferred_local_activities();
        }

        self.event_loop()?;
        self.maybe_complete_workflow()?;

        if slice.replay {
            // This task's commands were flushed when it originally ran;
            // re-flush for state only, then match its records FIFO.
            let _ = self.flush_commands();
            for event in &slice.command_events {
                self.handle_command_event(event)?;
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        if event.is_final_workflow_event() {
            self.have_seen_terminal_event = true;
        }
        match &event.attributes {
            EventAttributes::WorkflowStarted { .. } => self.start_workflow(event),
            EventAttributes::WorkflowTaskScheduled => {
                let mut machine = Machine::new(MachineKind::WorkflowTask(
                    workflow_task::WorkflowTaskMachine::new(event.event_id),
                ));
                machine.state = MachineState::Initiated;
                let key = self.machines.insert(machine);
                self.machines_by_event_id.insert(event.event_id, key);
                Ok(())
            }
            EventAttributes::WorkflowSignaled { signal_name, input } => {
                lock(&self.shared).deliver_signal(signal_name, input.clone());
                Ok(())
            }
            EventAttributes::WorkflowCancelRequested { reason } => {
                lock(&self.shared).request_cancel(reason.clone());
                Ok(())
            }
            _ => {
                if is_force_timer_event(event) {
                    return Ok(());
                }
                let Some(initial_id) = event.initial_command_event_id() else {
                    return Err(DeciderError::Fatal(format!(
                        "event {} ({}) has no machine routing",
                        event.event_id,
                        event.name()
                    )));
                };
                let key = self.machines_by_event_id.remove(&initial_id).ok_or_else(|| {
                    DeciderError::NonDeterministic(format!(
                        "event {} ({}) references initial command event {} but no machine is \
                         registered for it",
                        event.event_id,
                        event.name(),
                        initial_id
                    ))
                })?;
                let actions = self.machines.get_mut(key).apply_event(event)?;
                self.process_actions(key, actions)?;
                if !self.machines.get(key).is_final() {
                    self.machines_by_event_id.insert(initial_id, key);
                }
                Ok(())
            }
        }
    }

    /// Match one command record against the front of the command buffer.
    fn handle_command_event(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        if event.is_final_workflow_event() {
            self.have_seen_terminal_event = true;
        }
        // Local-activity markers are results, not commands: route them by
        // activity id wherever their echo sits in the buffer.
        if let Some(la) = markers::as_local_activity_marker(event) {
            if let Some(&key) = self.la_machines_by_id.get(&la.activity_id) {
                if let Some(pos) = self.commands.iter().position(|pc| pc.machine == key) {
                    let pc = self.commands.remove(pos).expect("position just found");
                    let actions = self.machines.get_mut(pc.machine).apply_event(event)?;
                    self.process_actions(pc.machine, actions)?;
                }
            } else {
                debug!(
                    activity_id = %la.activity_id,
                    "absorbing marker for a local activity the workflow no longer schedules"
                );
            }
            return Ok(());
        }
        if is_force_timer_event(event) {
            return Ok(());
        }

        loop {
            let Some(pc) = self.commands.pop_front() else {
                return Err(DeciderError::NonDeterministic(format!(
                    "no command scheduled for event {} ({})",
                    event.event_id,
                    event.name()
                )));
            };
            if self.machines.get(pc.machine).was_canceled_before_sent() {
                continue;
            }
            if !pc.sent {
                return Err(DeciderError::NonDeterministic(format!(
                    "event {} ({}) arrived for a command that was never flushed: {}",
                    event.event_id,
                    event.name(),
                    pc.command.name()
                )));
            }
            validate_command(&pc.command, self.machines.get(pc.machine), event)?;
            let actions = self.machines.get_mut(pc.machine).apply_event(event)?;
            self.process_actions(pc.machine, actions)?;
            if !self.machines.get(pc.machine).is_final() {
                self.machines_by_event_id.insert(event.event_id, pc.machine);
            }
            return Ok(());
        }
    }

    fn start_workflow(&mut self, event: &HistoryEvent) -> Result<(), DeciderError> {
        let EventAttributes::WorkflowStarted {
            input,
            original_run_id,
            task_queue,
            workflow_task_timeout_ms,
            ..
        } = &event.attributes
        else {
            return Err(DeciderError::Fatal("start_workflow on non-start event".into()));
        };
        if self.started {
            return Err(DeciderError::NonDeterministic(
                "second WorkflowStarted event in one run".into(),
            ));
        }
        {
            let mut state = lock(&self.shared);
            state.start_input = input.clone();
            state.task_queue = task_queue.clone();
            state.workflow_task_timeout_ms = *workflow_task_timeout_ms;
            state.random_seed = run_id_seed(original_run_id);
        }
        let ctx = WfContext::new(self.shared.clone());
        let fut = (self.workflow_fn)(ctx);
        let shared = self.shared.clone();
        self.runner.add_task(
            "workflow-main".into(),
            Box::pin(async move {
                let result = fut.await;
                lock(&shared).main_result = Some(result);
            }),
        );
        self.started = true;
        Ok(())
    }

    /// Run the coroutines to quiescence, draining workflow operations
    /// between passes. Marker operations resolve inline, so a drain can
    /// wake coroutines and force another pass.
    fn event_loop(&mut self) -> Result<(), DeciderError> {
        loop {
            self.adopt_spawned();
            self.runner.run_until_blocked();
            let drained = self.drain_ops()?;
            let more_spawned = !lock(&self.shared).spawned.is_empty();
            if !drained && !more_spawned && !self.runner.has_ready_tasks() {
                return Ok(());
            }
        }
    }

    fn adopt_spawned(&mut self) {
        let spawned = std::mem::take(&mut lock(&self.shared).spawned);
        for (name, fut) in spawned {
            self.runner.add_task(name, fut);
        }
    }

    fn drain_ops(&mut self) -> Result<bool, DeciderError> {
        let ops: Vec<WorkflowOp> = lock(&self.shared).ops.drain(..).collect();
        let drained = !ops.is_empty();
        for op in ops {
            debug!(op = op.name(), "applying workflow operation");
            self.apply_op(op)?;
        }
        Ok(drained)
    }

    // ── operation materialization ──

    fn apply_op(&mut self, op: WorkflowOp) -> Result<(), DeciderError> {
        match op {
            WorkflowOp::ScheduleActivity {
                seq,
                activity_type,
                input,
                options,
                handle,
            } => {
                if let Err(e) = options.validate() {
                    self.resolve(handle, Err(Failure::application(e.to_string())));
                    return Ok(());
                }
                let activity_id = options
                    .activity_id
                    .clone()
                    .unwrap_or_else(|| seq.to_string());
                let task_queue = options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| lock(&self.shared).task_queue.clone());
                let attrs = ScheduleActivityAttributes {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    task_queue,
                    input,
                    heartbeat_timeout_ms: options.heartbeat_timeout_ms.map(round_up_to_seconds),
                    schedule_to_close_timeout_ms: options
                        .schedule_to_close_timeout_ms
                        .map(round_up_to_seconds),
                    schedule_to_start_timeout_ms: options
                        .schedule_to_start_timeout_ms
                        .map(round_up_to_seconds),
                    start_to_close_timeout_ms: options
                        .start_to_close_timeout_ms
                        .map(round_up_to_seconds),
                    retry_policy: options.retry_policy.clone(),
                };
                let key = self.machines.insert(Machine::new(MachineKind::Activity(
                    activity::ActivityMachine {
                        seq,
                        activity_id,
                        activity_type,
                        cancellation_type: options.cancellation_type,
                        result_handle: handle,
                        scheduled_event_id: None,
                        abandoned: false,
                    },
                )));
                self.id_to_machine.insert(CommandId::Activity(seq), key);
                self.add_command(Command::ScheduleActivity(attrs), key)
            }
            WorkflowOp::CancelActivity { seq } => self.cancel_activity(seq),
            WorkflowOp::StartTimer {
                seq,
                duration_ms,
                handle,
            } => {
                let timer_id = seq.to_string();
                let key = self
                    .machines
                    .insert(Machine::new(MachineKind::Timer(timer::TimerMachine {
                        seq,
                        timer_id: timer_id.clone(),
                        fire_handle: handle,
                        started_event_id: None,
                    })));
                self.id_to_machine.insert(CommandId::Timer(seq), key);
                self.add_command(
                    Command::StartTimer(StartTimerAttributes {
                        timer_id,
                        start_to_fire_timeout_ms: round_up_to_seconds(duration_ms),
                    }),
                    key,
                )
            }
            WorkflowOp::CancelTimer { seq } => self.cancel_timer(seq),
            WorkflowOp::StartChildWorkflow {
                seq,
                workflow_type,
                input,
                options,
                start_handle,
                result_handle,
            } => {
                if let Err(e) = options.validate() {
                    let failure = Failure::application(e.to_string());
                    self.resolve(start_handle, Err(failure.clone()));
                    self.resolve(result_handle, Err(failure));
                    return Ok(());
                }
                let attrs = StartChildWorkflowAttributes {
                    workflow_id: options.workflow_id.clone(),
                    workflow_type: workflow_type.clone(),
                    task_queue: options.task_queue.clone(),
                    input,
                    workflow_run_timeout_ms: options
                        .workflow_run_timeout_ms
                        .map(round_up_to_seconds),
                    workflow_execution_timeout_ms: options
                        .workflow_execution_timeout_ms
                        .map(round_up_to_seconds),
                    workflow_task_timeout_ms: options
                        .workflow_task_timeout_ms
                        .map(round_up_to_seconds),
                    retry_policy: options.retry_policy.clone(),
                    cron_schedule: options.cron_schedule.clone(),
                };
                let key = self.machines.insert(Machine::new(MachineKind::ChildWorkflow(
                    child_workflow::ChildWorkflowMachine {
                        seq,
                        workflow_id: options.workflow_id.clone(),
                        workflow_type,
                        cancellation_type: options.cancellation_type,
                        start_handle,
                        result_handle,
                        initiated_event_id: None,
                        abandoned: false,
                    },
                )));
                self.id_to_machine.insert(CommandId::Child(seq), key);
                self.add_command(Command::StartChildWorkflow(attrs), key)
            }
            WorkflowOp::CancelChildWorkflow { seq } => self.cancel_child(seq),
            WorkflowOp::SignalExternal {
                seq,
                execution,
                signal_name,
                input,
                child_workflow_only,
                handle,
            } => {
                let key = self.machines.insert(Machine::new(MachineKind::SignalExternal(
                    external::SignalExternalMachine {
                        seq,
                        execution: execution.clone(),
                        signal_name: signal_name.clone(),
                        handle,
                    },
                )));
                self.id_to_machine.insert(CommandId::SignalExternal(seq), key);
                self.add_command(
                    Command::SignalExternal(windward_types::SignalExternalAttributes {
                        execution,
                        signal_name,
                        input,
                        child_workflow_only,
                    }),
                    key,
                )
            }
            WorkflowOp::CancelSignalExternal { seq } => {
                let key = self.machine_for(CommandId::SignalExternal(seq))?;
                let machine = self.machines.get_mut(key);
                let state = machine.state;
                let MachineKind::SignalExternal(m) = &mut machine.kind else {
                    return Err(DeciderError::Fatal("signal machine kind mismatch".into()));
                };
                let (next, actions) = external::signal_cancel(m, state);
                machine.state = next;
                self.process_actions(key, actions)
            }
            WorkflowOp::RequestCancelExternal {
                seq,
                execution,
                handle,
            } => {
                let key = self.machines.insert(Machine::new(MachineKind::CancelExternal(
                    external::CancelExternalMachine {
                        seq,
                        execution: execution.clone(),
                        handle: Some(handle),
                        notify_child: None,
                    },
                )));
                self.id_to_machine.insert(CommandId::CancelExternal(seq), key);
                self.add_command(
                    Command::RequestCancelExternal(windward_types::RequestCancelExternalAttributes {
                        execution,
                        child_workflow_only: false,
                    }),
                    key,
                )
            }
            WorkflowOp::ScheduleLocalActivity {
                seq,
                activity_type,
                input,
                options,
                handle,
            } => self.schedule_local_activity(seq, activity_type, input, options, handle),
            WorkflowOp::SideEffect { func, handle } => self.side_effect(func, handle),
            WorkflowOp::MutableSideEffect { id, func, handle } => {
                self.mutable_side_effect(id, func, handle)
            }
            WorkflowOp::GetVersion {
                change_id,
                min_supported,
                max_supported,
                handle,
            } => self.get_version(change_id, min_supported, max_supported, handle),
            WorkflowOp::UpsertSearchAttributes { attributes } => {
                let key = self.machines.insert(Machine::new(MachineKind::SearchAttributes(
                    marker_machine::SearchAttributesMachine,
                )));
                self.add_command(Command::UpsertSearchAttributes { attributes }, key)
            }
        }
    }

    fn cancel_activity(&mut self, seq: u32) -> Result<(), DeciderError> {
        let key = self.machine_for(CommandId::Activity(seq))?;
        let machine = self.machines.get_mut(key);
        let state = machine.state;
        let MachineKind::Activity(m) = &mut machine.kind else {
            return Err(DeciderError::Fatal("activity machine kind mismatch".into()));
        };
        let outcome = activity::cancel(m, state);
        let activity_id = m.activity_id.clone();
        let result_handle = m.result_handle;
        machine.state = outcome.new_state;
        if let Some(command) = outcome.command {
            self.add_command(command, key)?;
        }
        if outcome.resolve_now {
            self.resolve(
                result_handle,
                Err(Failure::canceled(format!("activity {activity_id} canceled"))),
            );
        }
        Ok(())
    }

    fn cancel_timer(&mut self, seq: u32) -> Result<(), DeciderError> {
        let key = self.machine_for(CommandId::Timer(seq))?;
        let machine = self.machines.get_mut(key);
        let state = machine.state;
        let MachineKind::Timer(m) = &mut machine.kind else {
            return Err(DeciderError::Fatal("timer machine kind mismatch".into()));
        };
        let outcome = timer::cancel(m, state);
        let failure = timer::canceled_failure(m);
        let fire_handle = m.fire_handle;
        machine.state = outcome.new_state;
        if let Some(command) = outcome.command {
            self.add_command(command, key)?;
        }
        // Timer cancellation is immediate: the waiting coroutine observes
        // it in this very event loop, before any further history event.
        self.resolve(fire_handle, Err(failure));
        Ok(())
    }

    fn cancel_child(&mut self, seq: u32) -> Result<(), DeciderError> {
        use child_workflow::ChildCancelOutcome::*;
        let key = self.machine_for(CommandId::Child(seq))?;
        let machine = self.machines.get_mut(key);
        let state = machine.state;
        let MachineKind::ChildWorkflow(m) = &mut machine.kind else {
            return Err(DeciderError::Fatal("child machine kind mismatch".into()));
        };
        let (next, outcome) = child_workflow::cancel(m, state);
        let failure = child_workflow::canceled_failure(m);
        let start_handle = m.start_handle;
        let result_handle = m.result_handle;
        let workflow_id = m.workflow_id.clone();
        let wait_requested = m.cancellation_type
            == windward_types::ChildWorkflowCancellationType::WaitCancellationRequested;
        machine.state = next;
        match outcome {
            DropUnsent => {
                self.resolve(start_handle, Err(failure.clone()));
                self.resolve(result_handle, Err(failure));
            }
            Detach => {
                self.resolve(result_handle, Err(failure));
            }
            CancelExternally { resolve_now } => {
                let cancel_key = self.machines.insert(Machine::new(MachineKind::CancelExternal(
                    external::CancelExternalMachine {
                        seq,
                        execution: WorkflowExecution::new(workflow_id.clone(), ""),
                        handle: None,
                        notify_child: wait_requested.then_some(key),
                    },
                )));
                self.add_command(
                    Command::RequestCancelExternal(windward_types::RequestCancelExternalAttributes {
                        execution: WorkflowExecution::new(workflow_id, ""),
                        child_workflow_only: true,
                    }),
                    cancel_key,
                )?;
                if resolve_now {
                    self.resolve(result_handle, Err(failure));
                }
            }
        }
        Ok(())
    }

    // ── marker operations ──

    fn side_effect(
        &mut self,
        func: Box<dyn FnOnce() -> Payload + Send>,
        handle: usize,
    ) -> Result<(), DeciderError> {
        self.reconcile_version_markers(None)?;
        let reserved = self.next_reserved_event_id();
        let replaying = lock(&self.shared).replaying;
        let value = if replaying {
            self.marker_handler
                .side_effect(reserved)
                .cloned()
                .ok_or_else(|| {
                    DeciderError::NonDeterministic(format!(
                        "no side effect recorded at event {reserved}"
                    ))
                })?
        } else {
            let value = func();
            self.marker_handler.record_side_effect(reserved, value.clone());
            value
        };
        let key = self
            .machines
            .insert(Machine::new(MachineKind::Marker(marker_machine::MarkerMachine {
                marker_name: windward_types::SIDE_EFFECT_MARKER_NAME.into(),
            })));
        self.push_command(Command::RecordMarker(markers::side_effect_marker(value.clone())), key);
        self.resolve(handle, Ok(Some(value)));
        Ok(())
    }

    fn mutable_side_effect(
        &mut self,
        id: String,
        func: Box<dyn FnOnce(Option<&Payload>) -> Option<Payload> + Send>,
        handle: usize,
    ) -> Result<(), DeciderError> {
        self.reconcile_version_markers(None)?;
        let reserved = self.next_reserved_event_id();
        let access = self.marker_handler.bump_mutable_access(&id);
        let replaying = lock(&self.shared).replaying;

        if replaying {
            let recorded = self.replay_command_event_at(reserved).and_then(|event| {
                markers::as_mutable_marker(event).and_then(|(marker_id, value, marker_access)| {
                    (marker_id == id && marker_access <= access)
                        .then(|| (value.clone(), marker_access))
                })
            });
            match recorded {
                Some((value, marker_access)) => {
                    self.marker_handler.store_mutable(&id, value.clone());
                    let key = self.marker_machine_key(
                        windward_types::MUTABLE_SIDE_EFFECT_MARKER_NAME,
                    );
                    self.push_command(
                        Command::RecordMarker(markers::mutable_marker(
                            &id,
                            reserved,
                            marker_access,
                            value.clone(),
                        )),
                        key,
                    );
                    self.resolve(handle, Ok(Some(value)));
                }
                None => {
                    let stored = self.marker_handler.stored_mutable(&id).cloned();
                    self.resolve(handle, Ok(stored));
                }
            }
        } else {
            let stored = self.marker_handler.stored_mutable(&id).cloned();
            match func(stored.as_ref()) {
                Some(value) => {
                    self.marker_handler.store_mutable(&id, value.clone());
                    let key = self.marker_machine_key(
                        windward_types::MUTABLE_SIDE_EFFECT_MARKER_NAME,
                    );
                    self.push_command(
                        Command::RecordMarker(markers::mutable_marker(
                            &id, reserved, access, value.clone(),
                        )),
                        key,
                    );
                    self.resolve(handle, Ok(Some(value)));
                }
                None => self.resolve(handle, Ok(stored)),
            }
        }
        Ok(())
    }

    fn get_version(
        &mut self,
        change_id: String,
        min_supported: i32,
        max_supported: i32,
        handle: usize,
    ) -> Result<(), DeciderError> {
        self.reconcile_version_markers(Some(&change_id))?;
        let reserved = self.next_reserved_event_id();
        let access = self.marker_handler.bump_version_access(&change_id);
        let replaying = lock(&self.shared).replaying;

        let recorded = self.replay_command_event_at(reserved).and_then(|event| {
            markers::as_version_marker(event).and_then(|(marker_id, version, marker_access)| {
                (marker_id == change_id && marker_access <= access)
                    .then_some((version, marker_access))
            })
        });

        let version = match recorded {
            Some((version, marker_access)) => {
                self.marker_handler.set_version(&change_id, version);
                let key = self.marker_machine_key(windward_types::VERSION_MARKER_NAME);
                self.push_command(
                    Command::RecordMarker(markers::version_marker(
                        &change_id,
                        reserved,
                        marker_access,
                        version,
                    )),
                    key,
                );
                version
            }
            None => match self.marker_handler.version(&change_id) {
                Some(version) => version,
                None if replaying => crate::context::DEFAULT_VERSION,
                None => {
                    self.marker_handler.set_version(&change_id, max_supported);
                    let key = self.marker_machine_key(windward_types::VERSION_MARKER_NAME);
                    self.push_command(
                        Command::RecordMarker(markers::version_marker(
                            &change_id,
                            reserved,
                            access,
                            max_supported,
                        )),
                        key,
                    );
                    max_supported
                }
            },
        };

        if version != crate::context::DEFAULT_VERSION
            && (version < min_supported || version > max_supported)
        {
            self.resolve(
                handle,
                Err(Failure::application(format!(
                    "change {change_id} has recorded version {version}, outside supported \
                     [{min_supported}, {max_supported}]"
                ))),
            );
            return Ok(());
        }
        self.resolve(handle, Ok(Payload::json(&version).ok()));
        Ok(())
    }

    /// Keep the command stream aligned with history when `get_version`
    /// calls were removed: while the upcoming record is a version marker
    /// for a change id nobody is asking about, echo it unconditionally.
    fn reconcile_version_markers(
        &mut self,
        requested_change_id: Option<&str>,
    ) -> Result<(), DeciderError> {
        loop {
            let reserved = self.next_reserved_event_id();
            let Some((change_id, version, access)) = self
                .replay_command_event_at(reserved)
                .and_then(markers::as_version_marker)
                .map(|(c, v, a)| (c.to_string(), v, a))
            else {
                return Ok(());
            };
            if requested_change_id == Some(change_id.as_str()) {
                return Ok(());
            }
            warn!(
                change_id = %change_id,
                version,
                "backfilling version marker for a removed get_version call"
            );
            self.marker_handler.set_version(&change_id, version);
            let key = self.marker_machine_key(windward_types::VERSION_MARKER_NAME);
            self.push_command(
                Command::RecordMarker(markers::version_marker(&change_id, reserved, access, version)),
                key,
            );
        }
    }

    // ── local activities ──

    fn schedule_local_activity(
        &mut self,
        seq: u32,
        activity_type: String,
        input: Option<Payload>,
        options: windward_types::LocalActivityOptions,
        handle: usize,
    ) -> Result<(), DeciderError> {
        let activity_id = seq.to_string();
        let key = self.machines.insert(Machine::new(MachineKind::LocalActivity(
            la_machine::LocalActivityMachine {
                seq,
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
                input: input.clone(),
                options: options.clone(),
                result_handle: handle,
            },
        )));
        self.la_machines_by_id.insert(activity_id.clone(), key);
        self.id_to_machine.insert(CommandId::LocalActivity(seq), key);

        let request = LocalActivityRequest {
            seq,
            activity_id: activity_id.clone(),
            activity_type,
            input,
            options,
            attempt: 1,
            not_before_ms: 0,
        };
        let recorded = self
            .la_recorded
            .get_mut(&activity_id)
            .and_then(|queue| queue.pop_front());
        match recorded {
            Some(marker) => self.apply_local_activity_marker(key, marker),
            None => {
                if lock(&self.shared).replaying {
                    // Either a later slice carries the marker, or the fresh
                    // slice will resubmit this for real execution.
                    self.la_deferred.push(DeferredLocalActivity { request });
                } else {
                    self.la_pending.push(request);
                }
                Ok(())
            }
        }
    }

    /// A local-activity marker reached the decider before the workflow
    /// replayed its schedule call, or after (via the machine side map).
    fn note_local_activity_marker(
        &mut self,
        marker: LocalActivityMarkerData,
    ) -> Result<(), DeciderError> {
        if let Some(&key) = self.la_machines_by_id.get(&marker.activity_id) {
            if !self.machines.get(key).is_final() {
                let activity_id = marker.activity_id.clone();
                self.la_deferred
                    .retain(|d| d.request.activity_id != activity_id);
                return self.apply_local_activity_marker(key, marker);
            }
        }
        self.la_recorded
            .entry(marker.activity_id.clone())
            .or_default()
            .push_back(marker);
        Ok(())
    }

    /// Record the marker's echo command and settle the machine's future or
    /// deferred retry.
    fn apply_local_activity_marker(
        &mut self,
        key: MachineKey,
        marker: LocalActivityMarkerData,
    ) -> Result<(), DeciderError> {
        self.add_command(
            Command::RecordMarker(markers::local_activity_marker(&marker)),
            key,
        )?;
        self.advance_clock(marker.replay_time_ms);

        let machine = self.machines.get(key);
        let MachineKind::LocalActivity(m) = &machine.kind else {
            return Err(DeciderError::Fatal("local activity machine kind mismatch".into()));
        };
        let result_handle = m.result_handle;

        if marker.is_terminal() {
            let result: OpResult = match &marker.failure {
                Some(failure) => Err(Failure::new(
                    FailureKind::Activity,
                    format!("{} failed", m.describe()),
                )
                .caused_by(failure.clone())),
                None => Ok(marker.result.clone()),
            };
            self.resolve(result_handle, result);
        } else {
            let request = LocalActivityRequest {
                seq: m.seq,
                activity_id: m.activity_id.clone(),
                activity_type: m.activity_type.clone(),
                input: m.input.clone(),
                options: m.options.clone(),
                attempt: marker.attempt + 1,
                not_before_ms: marker.replay_time_ms + marker.backoff_ms.unwrap_or(0),
            };
            self.la_deferred.push(DeferredLocalActivity { request });
            self.force_new_task = true;
        }
        Ok(())
    }

    fn resubmit_deferred_local_activities(&mut self) {
        for deferred in self.la_deferred.drain(..) {
            self.la_pending.push(deferred.request);
        }
    }

    // ── terminal commands ──

    fn maybe_complete_workflow(&mut self) -> Result<(), DeciderError> {
        if self.terminal_issued {
            return Ok(());
        }
        let Some(result) = lock(&self.shared).main_result.clone() else {
            return Ok(());
        };
        let command = match result {
            Ok(WorkflowExitValue::Normal(result)) => Command::CompleteWorkflow { result },
            Ok(WorkflowExitValue::ContinueAsNew(attrs)) => Command::ContinueAsNew(attrs),
            Ok(WorkflowExitValue::Canceled) => Command::CancelWorkflow { details: None },
            Err(failure) if failure.is_canceled() => Command::CancelWorkflow {
                details: failure.payload.clone(),
            },
            Err(failure) => {
                if self.config.fail_workflow_task_on.contains(&failure.kind) {
                    return Err(DeciderError::WorkflowTaskFailure(failure));
                }
                Command::FailWorkflow { failure }
            }
        };
        let key = self
            .machines
            .insert(Machine::new(MachineKind::WorkflowSelf(
                workflow_self::WorkflowSelfMachine,
            )));
        self.add_command(command, key)?;
        self.terminal_issued = true;
        Ok(())
    }

    // ── command buffer ──

    /// Flush unsent commands (bounded by the per-task ceiling), advancing
    /// their machines to `CommandSent`, and return the outbound command
    /// list, appending the force-immediate-decision timer on overflow.
    fn flush_commands(&mut self) -> Vec<Command> {
        let unsent = self
            .commands
            .iter()
            .filter(|pc| !pc.sent && !self.machines.get(pc.machine).was_canceled_before_sent())
            .count();
        let overflow = unsent > MAX_COMMANDS_PER_TASK;
        let send_count = if overflow {
            MAX_COMMANDS_PER_TASK - 1
        } else {
            unsent
        };

        let mut out = Vec::with_capacity(send_count + 1);
        for index in 0..self.commands.len() {
            if out.len() == send_count {
                break;
            }
            let (machine, sent) = {
                let pc = &self.commands[index];
                (pc.machine, pc.sent)
            };
            if sent {
                continue;
            }
            if self.machines.get(machine).was_canceled_before_sent() {
                // Withdrawn before ever flushing; it never goes out.
                self.commands[index].sent = true;
                continue;
            }
            self.machines.get_mut(machine).handle_workflow_task_started();
            self.commands[index].sent = true;
            out.push(self.commands[index].command.clone());
        }

        if overflow {
            warn!(
                sent = send_count,
                "command overflow; appending force-immediate-decision timer"
            );
            if !out.last().map(Command::is_terminal).unwrap_or(false) {
                out.push(Command::StartTimer(StartTimerAttributes {
                    timer_id: FORCE_IMMEDIATE_DECISION_TIMER_ID.to_string(),
                    start_to_fire_timeout_ms: 0,
                }));
            }
        }
        out
    }

    /// Buffer a command, reconciling pending version markers first (except
    /// for version markers themselves, which are the reconciliation).
    fn add_command(&mut self, command: Command, machine: MachineKey) -> Result<(), DeciderError> {
        let is_version_marker = matches!(
            &command,
            Command::RecordMarker(data) if data.name == windward_types::VERSION_MARKER_NAME
        );
        if !is_version_marker {
            self.reconcile_version_markers(None)?;
        }
        self.push_command(command, machine);
        Ok(())
    }

    fn push_command(&mut self, command: Command, machine: MachineKey) {
        debug!(command = command.name(), "buffering command");
        self.commands.push_back(PendingCommand {
            command,
            machine,
            sent: false,
        });
        self.slice_commands_created += 1;
    }

    fn marker_machine_key(&mut self, name: &str) -> MachineKey {
        self.machines
            .insert(Machine::new(MachineKind::Marker(marker_machine::MarkerMachine {
                marker_name: name.to_string(),
            })))
    }

    /// The history position the next buffered command will occupy.
    fn next_reserved_event_id(&self) -> i64 {
        self.slice_base_event_id + self.slice_commands_created
    }

    fn replay_command_event_at(&self, event_id: i64) -> Option<&HistoryEvent> {
        let offset = event_id.checked_sub(self.slice_base_event_id)?;
        if offset < 0 {
            return None;
        }
        self.replay_command_events.get(offset as usize)
    }

    // ── plumbing ──

    fn machine_for(&self, id: CommandId) -> Result<MachineKey, DeciderError> {
        self.id_to_machine
            .get(&id)
            .copied()
            .ok_or_else(|| DeciderError::Fatal(format!("no machine for {id:?}")))
    }

    fn resolve(&mut self, handle: usize, result: OpResult) {
        lock(&self.shared).resolve_slot(handle, result);
    }

    fn advance_clock(&mut self, time_ms: i64) {
        let mut state = lock(&self.shared);
        if time_ms > state.current_time_ms {
            state.current_time_ms = time_ms;
        }
    }

    fn process_actions(
        &mut self,
        key: MachineKey,
        actions: Vec<MachineAction>,
    ) -> Result<(), DeciderError> {
        for action in actions {
            match action {
                MachineAction::Resolve { handle, result } => self.resolve(handle, result),
                MachineAction::AdvanceClock { time_ms } => self.advance_clock(time_ms),
                MachineAction::TriggerTaskStarted {
                    started_event_id,
                    time_ms,
                } => {
                    self.current_started_event_id = started_event_id;
                    self.advance_clock(time_ms);
                }
                MachineAction::IssueCommand { command } => self.add_command(command, key)?,
                MachineAction::NotifyChildCancelRequested { child } => {
                    let machine = self.machines.get(child);
                    if let MachineKind::ChildWorkflow(m) = &machine.kind {
                        let failure = child_workflow::canceled_failure(m);
                        let handle = m.result_handle;
                        self.resolve(handle, Err(failure));
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_force_timer_event(event: &HistoryEvent) -> bool {
    match &event.attributes {
        EventAttributes::TimerStarted { timer_id, .. }
        | EventAttributes::TimerFired { timer_id, .. }
        | EventAttributes::TimerCanceled { timer_id, .. } => {
            timer_id == FORCE_IMMEDIATE_DECISION_TIMER_ID
        }
        _ => false,
    }
}

/// Validate a command against the record the server wrote for it. Equal
/// kinds, equal ids, equal types; anything else is non-determinism.
fn validate_command(
    command: &Command,
    machine: &Machine,
    event: &HistoryEvent,
) -> Result<(), DeciderError> {
    let ok = match (command, &event.attributes) {
        (
            Command::ScheduleActivity(attrs),
            EventAttributes::ActivityScheduled {
                activity_id,
                activity_type,
                ..
            },
        ) => attrs.activity_id == *activity_id && attrs.activity_type == *activity_type,
        (
            Command::RequestCancelActivity { .. },
            EventAttributes::ActivityCancelRequested { scheduled_event_id },
        ) => match &machine.kind {
            MachineKind::Activity(m) => m.scheduled_event_id == Some(*scheduled_event_id),
            _ => false,
        },
        (Command::StartTimer(attrs), EventAttributes::TimerStarted { timer_id, .. }) => {
            attrs.timer_id == *timer_id
        }
        (Command::CancelTimer { timer_id }, EventAttributes::TimerCanceled { timer_id: tid, .. }) => {
            timer_id == tid
        }
        (Command::RecordMarker(data), EventAttributes::MarkerRecorded(recorded)) => {
            data.name == recorded.name
                && match (&data.header, &recorded.header) {
                    (Some(a), Some(b)) => a.id == b.id,
                    (None, None) => true,
                    _ => false,
                }
        }
        (
            Command::StartChildWorkflow(attrs),
            EventAttributes::ChildWorkflowInitiated {
                workflow_id,
                workflow_type,
            },
        ) => attrs.workflow_id == *workflow_id && attrs.workflow_type == *workflow_type,
        (
            Command::SignalExternal(attrs),
            EventAttributes::SignalExternalInitiated {
                execution,
                signal_name,
            },
        ) => attrs.execution.workflow_id == execution.workflow_id
            && attrs.signal_name == *signal_name,
        (
            Command::RequestCancelExternal(attrs),
            EventAttributes::CancelExternalInitiated { execution },
        ) => attrs.execution.workflow_id == execution.workflow_id,
        (
            Command::UpsertSearchAttributes { .. },
            EventAttributes::UpsertSearchAttributes { .. },
        ) => true,
        (Command::CompleteWorkflow { .. }, EventAttributes::WorkflowCompleted { .. }) => true,
        (Command::FailWorkflow { .. }, EventAttributes::WorkflowFailed { .. }) => true,
        (Command::CancelWorkflow { .. }, EventAttributes::WorkflowCanceled { .. }) => true,
        (Command::ContinueAsNew(_), EventAttributes::WorkflowContinuedAsNew { .. }) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(DeciderError::NonDeterministic(format!(
            "command {} does not match event {} ({})",
            command.name(),
            event.event_id,
            event.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;
    use std::sync::Mutex as StdMutex;

    use rand::Rng;

    use crate::context::workflow_fn;
    use crate::state::WorkflowExitValue;
    use crate::testing::{TEST_EPOCH_MS, TestHistoryBuilder};
    use windward_types::{
        ActivityOptions, ChildWorkflowCancellationType, ChildWorkflowOptions,
    };

    fn exec() -> WorkflowExecution {
        WorkflowExecution::new("wf-1", "run-1")
    }

    fn decider_with(f: crate::context::WorkflowFunction) -> Decider {
        Decider::new(exec(), "Test", f, DeciderConfig::default())
    }

    fn run(decider: &mut Decider, t: &TestHistoryBuilder) -> Result<TaskDecisions, DeciderError> {
        let task = t.as_workflow_task(&exec()).unwrap();
        decider.apply_history(&task)?;
        decider.finalize()
    }

    fn act_opts() -> ActivityOptions {
        ActivityOptions {
            schedule_to_close_timeout_ms: Some(60_000),
            ..ActivityOptions::default()
        }
    }

    /// Park forever without completing the workflow.
    async fn block_on_missing_signal(ctx: &WfContext) {
        let _ = ctx.signal_channel("never-sent").next().await;
    }

    // S1: sleep then activity. The final task must emit exactly one
    // ScheduleActivity with the deterministic sequence-derived id.
    #[test]
    fn timer_then_activity_emits_one_schedule_command() {
        let observed_time = std::sync::Arc::new(StdMutex::new(None));
        let observed = observed_time.clone();
        let mut decider = decider_with(workflow_fn(move |ctx| {
            let observed = observed.clone();
            async move {
                ctx.sleep(10_000).await?;
                *observed.lock().unwrap() = Some(ctx.current_time_millis());
                let _ = ctx.activity("A", None, act_opts()).await;
                Ok(WorkflowExitValue::Normal(None))
            }
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        let timer_started = t.add_timer_started("0", 10_000);
        t.advance_time(10_000);
        t.add_timer_fired(timer_started, "0");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), 1);
        match &decisions.commands[0] {
            Command::ScheduleActivity(attrs) => {
                assert_eq!(attrs.activity_id, "1");
                assert_eq!(attrs.activity_type, "A");
            }
            other => panic!("expected ScheduleActivity, got {other:?}"),
        }
        // The replay clock at the resume point is the fired timer's time.
        assert_eq!(*observed_time.lock().unwrap(), Some(TEST_EPOCH_MS + 10_000));
    }

    // Property 1: replaying a complete history emits no commands and
    // leaves no machine holding an obligation.
    #[test]
    fn full_replay_is_command_silent() {
        let wf = workflow_fn(move |ctx| async move {
            ctx.sleep(10_000).await?;
            let result = ctx.activity("A", None, act_opts()).await?;
            Ok(WorkflowExitValue::Normal(result))
        });

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        let timer_started = t.add_timer_started("0", 10_000);
        t.advance_time(10_000);
        t.add_timer_fired(timer_started, "0");
        t.add_full_workflow_task();
        let scheduled = t.add_activity_scheduled("1", "A");
        t.add_activity_started(scheduled);
        t.add_activity_completed(scheduled, Some(Payload::json(&"done").unwrap()));
        t.add_full_workflow_task();
        t.add_workflow_completed(Some(Payload::json(&"done").unwrap()));

        let mut decider = decider_with(wf);
        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
        assert_eq!(decider.open_machine_count(), 0);
        assert!(decider.workflow_finished());
    }

    // S2: a recorded side effect replays its cached value and never
    // invokes the closure.
    #[test]
    fn side_effect_replays_the_recorded_value() {
        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observed_value = std::sync::Arc::new(StdMutex::new(None));
        let invoked2 = invoked.clone();
        let observed2 = observed_value.clone();
        let mut decider = decider_with(workflow_fn(move |ctx| {
            let invoked = invoked2.clone();
            let observed = observed2.clone();
            async move {
                let value = ctx
                    .side_effect(move || {
                        invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                        Payload::json(&0u32).unwrap()
                    })
                    .await?
                    .expect("side effect value");
                *observed.lock().unwrap() = Some(value.decode_json::<u32>().unwrap());
                block_on_missing_signal(&ctx).await;
                Ok(WorkflowExitValue::Normal(None))
            }
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        t.add_side_effect_marker(Payload::json(&42u32).unwrap());
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
        assert_eq!(*observed_value.lock().unwrap(), Some(42));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    fn mutable_workflow(
        observed: std::sync::Arc<StdMutex<Vec<u32>>>,
    ) -> crate::context::WorkflowFunction {
        workflow_fn(move |ctx| {
            let observed = observed.clone();
            async move {
                for value in [1u32, 1, 2] {
                    let seen = ctx
                        .mutable_side_effect("k", move |prev| {
                            let encoded = Payload::json(&value).unwrap();
                            if prev == Some(&encoded) {
                                None
                            } else {
                                Some(encoded)
                            }
                        })
                        .await?
                        .expect("mutable side effect value");
                    observed.lock().unwrap().push(seen.decode_json().unwrap());
                }
                block_on_missing_signal(&ctx).await;
                Ok(WorkflowExitValue::Normal(None))
            }
        })
    }

    // S4 live half: update-only recording produces markers for 1 and 2.
    #[test]
    fn mutable_side_effect_records_only_changes() {
        let observed = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let mut decider = decider_with(mutable_workflow(observed.clone()));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        let markers: Vec<u32> = decisions
            .commands
            .iter()
            .map(|c| match c {
                Command::RecordMarker(data) => {
                    data.details.as_ref().unwrap().decode_json().unwrap()
                }
                other => panic!("expected markers only, got {other:?}"),
            })
            .collect();
        assert_eq!(markers, vec![1, 2]);
        assert_eq!(*observed.lock().unwrap(), vec![1, 1, 2]);
    }

    // S4 replay half: the same values surface in order, with no commands.
    #[test]
    fn mutable_side_effect_replays_in_call_order() {
        let observed = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let mut decider = decider_with(mutable_workflow(observed.clone()));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        t.add_mutable_side_effect_marker("k", Payload::json(&1u32).unwrap(), 1);
        t.add_mutable_side_effect_marker("k", Payload::json(&2u32).unwrap(), 3);
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
        assert_eq!(*observed.lock().unwrap(), vec![1, 1, 2]);
    }

    // S5: a removed get_version("A") call leaves its marker orphaned; the
    // decider backfills it so B's marker still lines up.
    #[test]
    fn removed_get_version_backfills_orphaned_markers() {
        let observed = std::sync::Arc::new(StdMutex::new(None));
        let observed2 = observed.clone();
        let mut decider = decider_with(workflow_fn(move |ctx| {
            let observed = observed2.clone();
            async move {
                let version = ctx.get_version("B", crate::context::DEFAULT_VERSION, 2).await?;
                *observed.lock().unwrap() = Some(version);
                block_on_missing_signal(&ctx).await;
                Ok(WorkflowExitValue::Normal(None))
            }
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        t.add_version_marker("A", 1, 1);
        t.add_version_marker("B", 2, 1);
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
        assert_eq!(*observed.lock().unwrap(), Some(2));
    }

    #[test]
    fn get_version_records_max_once_outside_replay() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let first = ctx.get_version("change", crate::context::DEFAULT_VERSION, 3).await?;
            let second = ctx.get_version("change", crate::context::DEFAULT_VERSION, 3).await?;
            assert_eq!(first, 3);
            assert_eq!(second, 3);
            block_on_missing_signal(&ctx).await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        // One marker for two calls: marker idempotence.
        assert_eq!(decisions.commands.len(), 1);
        match &decisions.commands[0] {
            Command::RecordMarker(data) => {
                assert_eq!(data.name, windward_types::VERSION_MARKER_NAME);
                assert_eq!(data.header.as_ref().unwrap().id, "change");
            }
            other => panic!("expected version marker, got {other:?}"),
        }
    }

    // S6: command overflow truncates to 9999 and appends the synthetic
    // zero-duration force timer.
    #[test]
    fn overflow_appends_the_force_immediate_decision_timer() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let mut handles: Vec<_> = (0..10_001)
                .map(|_| ctx.activity("A", None, act_opts()))
                .collect();
            let first = handles.swap_remove(0);
            let _ = first.await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), MAX_COMMANDS_PER_TASK);
        assert!(
            decisions.commands[..MAX_COMMANDS_PER_TASK - 1]
                .iter()
                .all(|c| matches!(c, Command::ScheduleActivity(_)))
        );
        match decisions.commands.last().unwrap() {
            Command::StartTimer(attrs) => {
                assert_eq!(attrs.timer_id, FORCE_IMMEDIATE_DECISION_TIMER_ID);
                assert_eq!(attrs.start_to_fire_timeout_ms, 0);
            }
            other => panic!("expected force timer, got {other:?}"),
        }
    }

    #[test]
    fn exactly_the_ceiling_needs_no_force_timer() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let mut handles: Vec<_> = (0..MAX_COMMANDS_PER_TASK)
                .map(|_| ctx.activity("A", None, act_opts()))
                .collect();
            let first = handles.swap_remove(0);
            let _ = first.await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), MAX_COMMANDS_PER_TASK);
        assert!(
            decisions
                .commands
                .iter()
                .all(|c| matches!(c, Command::ScheduleActivity(_)))
        );
    }

    // Property 2: uuids, PRNG output, and the clock replay identically.
    #[test]
    fn deterministic_sources_are_stable_across_replays() {
        fn observing_workflow(
            observed: std::sync::Arc<StdMutex<Vec<String>>>,
        ) -> crate::context::WorkflowFunction {
            workflow_fn(move |ctx| {
                let observed = observed.clone();
                async move {
                    {
                        let mut log = observed.lock().unwrap();
                        log.push(ctx.random_uuid().to_string());
                        log.push(ctx.random_uuid().to_string());
                        log.push(ctx.new_random().random::<u64>().to_string());
                        log.push(ctx.current_time_millis().to_string());
                    }
                    block_on_missing_signal(&ctx).await;
                    Ok(WorkflowExitValue::Normal(None))
                }
            })
        }

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let first = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let second = std::sync::Arc::new(StdMutex::new(Vec::new()));
        run(&mut decider_with(observing_workflow(first.clone())), &t).unwrap();
        run(&mut decider_with(observing_workflow(second.clone())), &t).unwrap();

        let first = first.lock().unwrap().clone();
        let second = second.lock().unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    // Property 6: cancelling an in-flight timer resolves the waiting
    // coroutine within the same task; the late TimerCanceled record is
    // absorbed on the next one.
    #[test]
    fn timer_cancel_is_prompt_and_late_records_are_absorbed() {
        fn cancelling_workflow(
            observed: std::sync::Arc<StdMutex<Option<bool>>>,
        ) -> crate::context::WorkflowFunction {
            workflow_fn(move |ctx| {
                let observed = observed.clone();
                async move {
                    let timer = ctx.timer(600_000);
                    let _ = ctx.signal_channel("cancel").next().await;
                    timer.cancel();
                    let outcome = timer.await;
                    *observed.lock().unwrap() =
                        Some(matches!(outcome, Err(ref f) if f.is_canceled()));
                    block_on_missing_signal(&ctx).await;
                    Ok(WorkflowExitValue::Normal(None))
                }
            })
        }

        let observed = std::sync::Arc::new(StdMutex::new(None));
        let mut decider = decider_with(cancelling_workflow(observed.clone()));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        let timer_started = t.add_timer_started("0", 600_000);
        t.add_workflow_signaled("cancel", None);
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(true));
        assert_eq!(decisions.commands.len(), 1);
        assert!(matches!(
            &decisions.commands[0],
            Command::CancelTimer { timer_id } if timer_id == "0"
        ));

        // Extend history with the cancel's record; replay absorbs it.
        t.add_workflow_task_completed();
        t.add_timer_canceled(timer_started, "0");
        t.add_workflow_task_scheduled_and_started();

        let observed_replay = std::sync::Arc::new(StdMutex::new(None));
        let mut replayed = decider_with(cancelling_workflow(observed_replay.clone()));
        let decisions = run(&mut replayed, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
        assert_eq!(*observed_replay.lock().unwrap(), Some(true));
    }

    fn child_cancel_workflow() -> crate::context::WorkflowFunction {
        workflow_fn(move |ctx| async move {
            let child = ctx.child_workflow(
                "Child",
                None,
                ChildWorkflowOptions {
                    workflow_id: "child-1".into(),
                    cancellation_type: ChildWorkflowCancellationType::WaitCancellationCompleted,
                    ..ChildWorkflowOptions::default()
                },
            );
            child.start_result().await?;
            child.cancel();
            let outcome = child.result().await;
            assert!(matches!(outcome, Err(ref f) if f.is_canceled()));
            Ok(WorkflowExitValue::Normal(None))
        })
    }

    // S3 first half: the cancel turns into a RequestCancelExternal and the
    // parent stays blocked.
    #[test]
    fn child_cancel_wait_completed_sends_cancel_external() {
        let mut decider = decider_with(child_cancel_workflow());

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        let initiated = t.add_child_initiated("child-1", "Child");
        t.add_child_started(initiated, "child-run");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), 1);
        match &decisions.commands[0] {
            Command::RequestCancelExternal(attrs) => {
                assert_eq!(attrs.execution.workflow_id, "child-1");
                assert!(attrs.child_workflow_only);
            }
            other => panic!("expected RequestCancelExternal, got {other:?}"),
        }
        assert!(!decider.workflow_finished());
    }

    // S3 second half: only the terminal ChildWorkflowCanceled unblocks the
    // parent.
    #[test]
    fn child_cancel_wait_completed_resolves_on_the_terminal_record() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        let initiated = t.add_child_initiated("child-1", "Child");
        t.add_child_started(initiated, "child-run");
        t.add_full_workflow_task();
        let cancel_initiated =
            t.add_cancel_external_initiated(WorkflowExecution::new("child-1", ""));
        t.add_external_cancel_requested(cancel_initiated);
        t.add_child_canceled(initiated);
        t.add_workflow_task_scheduled_and_started();

        let mut decider = decider_with(child_cancel_workflow());
        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), 1);
        assert!(matches!(
            decisions.commands[0],
            Command::CompleteWorkflow { .. }
        ));
    }

    // Signals arriving before any waiter buffer per name and drain in
    // arrival order.
    #[test]
    fn early_signals_buffer_in_arrival_order() {
        let observed = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let observed2 = observed.clone();
        let mut decider = decider_with(workflow_fn(move |ctx| {
            let observed = observed2.clone();
            async move {
                let channel = ctx.signal_channel("data");
                for _ in 0..2 {
                    let payload = channel.next().await?.expect("signal payload");
                    observed
                        .lock()
                        .unwrap()
                        .push(payload.decode_json::<String>().unwrap());
                }
                Ok(WorkflowExitValue::Normal(None))
            }
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_signaled("data", Some(Payload::json(&"first").unwrap()));
        t.add_workflow_signaled("data", Some(Payload::json(&"second").unwrap()));
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(*observed.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(decisions.commands.len(), 1);
        assert!(matches!(
            decisions.commands[0],
            Command::CompleteWorkflow { .. }
        ));
    }

    #[test]
    fn spawned_coroutines_run_after_their_parent_in_order() {
        let observed = std::sync::Arc::new(StdMutex::new(Vec::new()));
        let observed2 = observed.clone();
        let mut decider = decider_with(workflow_fn(move |ctx| {
            let observed = observed2.clone();
            async move {
                let side_log = observed.clone();
                ctx.spawn("side", async move {
                    side_log.lock().unwrap().push("side");
                });
                observed.lock().unwrap().push("main");
                block_on_missing_signal(&ctx).await;
                Ok(WorkflowExitValue::Normal(None))
            }
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        run(&mut decider, &t).unwrap();
        assert_eq!(*observed.lock().unwrap(), vec!["main", "side"]);
    }

    #[test]
    fn upsert_search_attributes_emits_its_command() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let mut attributes = std::collections::BTreeMap::new();
            attributes.insert(
                "CustomerTier".to_string(),
                Payload::json(&"gold").unwrap(),
            );
            ctx.upsert_search_attributes(attributes);
            block_on_missing_signal(&ctx).await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), 1);
        assert!(matches!(
            &decisions.commands[0],
            Command::UpsertSearchAttributes { attributes } if attributes.contains_key("CustomerTier")
        ));
    }

    #[test]
    fn workflow_failure_fails_the_workflow_by_default() {
        let mut decider = decider_with(workflow_fn(|_ctx| async {
            Err(Failure::application("user bug"))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands.len(), 1);
        assert!(matches!(
            &decisions.commands[0],
            Command::FailWorkflow { failure } if failure.message == "user bug"
        ));
    }

    #[test]
    fn configured_failure_kinds_fail_the_task_instead() {
        let mut decider = Decider::new(
            exec(),
            "Test",
            workflow_fn(|_ctx| async { Err(Failure::application("transient bug")) }),
            DeciderConfig {
                fail_workflow_task_on: vec![FailureKind::Application],
            },
        );

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let task = t.as_workflow_task(&exec()).unwrap();
        assert!(matches!(
            decider.apply_history(&task),
            Err(DeciderError::WorkflowTaskFailure(_))
        ));
    }

    // A command/record mismatch is fatal non-determinism.
    #[test]
    fn mismatched_command_and_record_is_nondeterminism() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let _ = ctx.activity("A", None, act_opts()).await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_full_workflow_task();
        // History recorded a timer, but the code schedules an activity.
        t.add_timer_started("0", 5_000);
        t.add_workflow_task_scheduled_and_started();

        let task = t.as_workflow_task(&exec()).unwrap();
        assert!(matches!(
            decider.apply_history(&task),
            Err(DeciderError::NonDeterministic(_))
        ));
    }

    // Signal-external cancel before the command is flushed collapses with
    // no wire effect.
    #[test]
    fn signal_external_cancel_before_flush_has_no_wire_effect() {
        let mut decider = decider_with(workflow_fn(move |ctx| async move {
            let signal = ctx.signal_external(
                WorkflowExecution::new("other-wf", ""),
                "ping",
                None,
                false,
            );
            signal.cancel();
            let outcome = signal.await;
            assert!(matches!(outcome, Err(ref f) if f.is_canceled()));
            block_on_missing_signal(&ctx).await;
            Ok(WorkflowExitValue::Normal(None))
        }));

        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();

        let decisions = run(&mut decider, &t).unwrap();
        assert_eq!(decisions.commands, Vec::<Command>::new());
    }
}
