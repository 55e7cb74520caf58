//! One state machine per in-flight side-effectful operation.
//!
//! The decider owns a flat table of machines addressed by integer handles;
//! buffered commands carry the handle of their originating machine, and
//! history events are routed back by initial command event id. No machine
//! holds a pointer to anything: transitions return [`MachineAction`]s and
//! the decider applies them, which keeps the object graph acyclic and the
//! whole table trivially droppable on cache eviction.
//!
//! Shared state space (not every variant visits every state):
//!
//! ```text
//! Created --send--> CommandSent --Initiated--> Initiated --Started--> Started
//!    |cancel           |cancel                    |cancel               |cancel
//!    v                 v                          v                     v
//! CanceledBeforeInitiated            CanceledAfterInitiated  CanceledAfterStarted
//!                      \______________________|______________________/
//!                                             v
//!                        CancellationCommandSent --Canceled--> Completed
//! ```
//!
//! Timers collapse Initiated into Started (one event covers both); signals
//! and markers never reach Started; markers complete on their own record.

pub(crate) mod activity;
pub(crate) mod child_workflow;
pub(crate) mod external;
pub(crate) mod local_activity;
pub(crate) mod marker;
pub(crate) mod timer;
pub(crate) mod workflow_self;
pub(crate) mod workflow_task;

use windward_types::Command;
use windward_types::event::HistoryEvent;

use crate::error::DeciderError;
use crate::futures::{FutureHandle, OpResult};

/// Handle into the decider's machine table. Machines are never removed
/// from the table, only unregistered from the event-id index, so handles
/// stay valid for the life of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MachineKey(pub(crate) usize);

/// Shared lifecycle states. See the module diagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MachineState {
    Created,
    CommandSent,
    Initiated,
    Started,
    CanceledBeforeInitiated,
    CanceledAfterInitiated,
    CanceledAfterStarted,
    CancellationCommandSent,
    Completed,
}

/// Side effects a transition asks the decider to perform.
#[derive(Debug)]
pub(crate) enum MachineAction {
    /// Resolve a workflow future slot.
    Resolve {
        handle: FutureHandle,
        result: OpResult,
    },
    /// Advance the replay clock (monotone; the decider maxes it in).
    AdvanceClock { time_ms: i64 },
    /// A workflow task started: update the current started event id and
    /// the replay clock.
    TriggerTaskStarted {
        started_event_id: i64,
        time_ms: i64,
    },
    /// Buffer a new command bound to the machine that produced it.
    IssueCommand { command: Command },
    /// A cancel-external machine observed the server's cancel
    /// acknowledgement for the child it was cancelling.
    NotifyChildCancelRequested { child: MachineKey },
}

/// Tagged machine variant. Each carries only the fields it needs.
pub(crate) enum MachineKind {
    Activity(activity::ActivityMachine),
    Timer(timer::TimerMachine),
    ChildWorkflow(child_workflow::ChildWorkflowMachine),
    SignalExternal(external::SignalExternalMachine),
    CancelExternal(external::CancelExternalMachine),
    Marker(marker::MarkerMachine),
    SearchAttributes(marker::SearchAttributesMachine),
    LocalActivity(local_activity::LocalActivityMachine),
    WorkflowTask(workflow_task::WorkflowTaskMachine),
    WorkflowSelf(workflow_self::WorkflowSelfMachine),
}

pub(crate) struct Machine {
    pub(crate) state: MachineState,
    pub(crate) kind: MachineKind,
    /// Whether this machine's command was ever flushed toward the server.
    /// Distinguishes "canceled, nothing sent" (skip silently) from
    /// "canceled with the command in flight" (chase with a cancel when the
    /// record shows up).
    pub(crate) command_flushed: bool,
}

impl Machine {
    pub(crate) fn new(kind: MachineKind) -> Self {
        Self {
            state: MachineState::Created,
            kind,
            command_flushed: false,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match &self.kind {
            MachineKind::Activity(_) => "Activity",
            MachineKind::Timer(_) => "Timer",
            MachineKind::ChildWorkflow(_) => "ChildWorkflow",
            MachineKind::SignalExternal(_) => "SignalExternal",
            MachineKind::CancelExternal(_) => "CancelExternal",
            MachineKind::Marker(_) => "Marker",
            MachineKind::SearchAttributes(_) => "SearchAttributes",
            MachineKind::LocalActivity(_) => "LocalActivity",
            MachineKind::WorkflowTask(_) => "WorkflowTask",
            MachineKind::WorkflowSelf(_) => "WorkflowSelf",
        }
    }

    /// Final machines are dropped from the event-id index and their queued
    /// commands are never sent.
    pub(crate) fn is_final(&self) -> bool {
        self.state == MachineState::Completed || self.was_canceled_before_sent()
    }

    /// True when the machine's command was withdrawn before ever reaching
    /// the server; such commands are silently skipped during matching.
    pub(crate) fn was_canceled_before_sent(&self) -> bool {
        self.state == MachineState::CanceledBeforeInitiated && !self.command_flushed
    }

    /// Commands for this task were flushed to the server: advance
    /// `Created` machines to `CommandSent` in insertion order.
    pub(crate) fn handle_workflow_task_started(&mut self) {
        if self.state == MachineState::Created {
            self.state = MachineState::CommandSent;
            self.command_flushed = true;
        }
    }

    /// Route a history event into the variant's transition function.
    pub(crate) fn apply_event(
        &mut self,
        event: &HistoryEvent,
    ) -> Result<Vec<MachineAction>, DeciderError> {
        let state = self.state;
        let (next, actions) = match &mut self.kind {
            MachineKind::Activity(m) => activity::on_event(m, state, event)?,
            MachineKind::Timer(m) => timer::on_event(m, state, event)?,
            MachineKind::ChildWorkflow(m) => child_workflow::on_event(m, state, event)?,
            MachineKind::SignalExternal(m) => external::signal_on_event(m, state, event)?,
            MachineKind::CancelExternal(m) => external::cancel_on_event(m, state, event)?,
            MachineKind::Marker(m) => marker::on_event(m, state, event)?,
            MachineKind::SearchAttributes(m) => marker::search_attributes_on_event(m, state, event)?,
            MachineKind::LocalActivity(m) => local_activity::on_event(m, state, event)?,
            MachineKind::WorkflowTask(m) => workflow_task::on_event(m, state, event)?,
            MachineKind::WorkflowSelf(m) => workflow_self::on_event(m, state, event)?,
        };
        self.state = next;
        Ok(actions)
    }
}

/// Error helper shared by the variant modules.
pub(crate) fn unexpected(
    kind: &'static str,
    state: MachineState,
    event: &HistoryEvent,
) -> DeciderError {
    DeciderError::NonDeterministic(format!(
        "{kind} machine in state {state:?} cannot handle {} (event {})",
        event.name(),
        event.event_id
    ))
}

/// Flat machine table.
#[derive(Default)]
pub(crate) struct MachineTable {
    machines: Vec<Machine>,
}

impl MachineTable {
    pub(crate) fn insert(&mut self, machine: Machine) -> MachineKey {
        self.machines.push(machine);
        MachineKey(self.machines.len() - 1)
    }

    pub(crate) fn get(&self, key: MachineKey) -> &Machine {
        &self.machines[key.0]
    }

    pub(crate) fn get_mut(&mut self, key: MachineKey) -> &mut Machine {
        &mut self.machines[key.0]
    }

    /// Machines still holding an unresolved obligation at end of history.
    /// Used by tests to assert the command/event pairing property.
    pub(crate) fn non_final_count(&self) -> usize {
        self.machines
            .iter()
            .filter(|m| {
                !m.is_final() && !matches!(m.kind, MachineKind::WorkflowTask(_))
            })
            .count()
    }
}
