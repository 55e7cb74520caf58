//! Chops a run's raw event stream into workflow-task slices.
//!
//! A slice is everything one workflow task saw: the new events delivered to
//! it, the command events recorded from its completion, whether the task is
//! being replayed, and where the next command record will land in history.
//!
//! Tasks that failed or timed out are discarded here, before the decider
//! ever sees them: the server treats them as never having happened and so
//! does replay.

use tracing::debug;
use windward_types::event::{EventAttributes, HistoryEvent};

use crate::error::DeciderError;

/// One workflow task's worth of history.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowTaskSlice {
    /// New non-command events delivered to the workflow since its last task,
    /// ending with the task's `WorkflowTaskStarted` when one exists.
    pub events: Vec<HistoryEvent>,
    /// Command records produced by this task's completion, used to replay
    /// the state machines deterministically.
    pub command_events: Vec<HistoryEvent>,
    /// True unless this is the freshest task in the stream.
    pub replay: bool,
    /// Timestamp of the task's `WorkflowTaskStarted`, in epoch millis.
    /// 0 for sticky slices that begin at a `WorkflowTaskCompleted`.
    pub replay_time_ms: i64,
    /// Event id the first new command from this task will occupy.
    pub next_command_event_id: i64,
}

/// Lazy slicer over one history page.
pub struct HistorySlices<'a> {
    events: &'a [HistoryEvent],
    pos: usize,
    exhausted: bool,
}

impl<'a> HistorySlices<'a> {
    pub fn new(events: &'a [HistoryEvent]) -> Result<Self, DeciderError> {
        if events.is_empty() {
            return Err(DeciderError::EmptyHistory);
        }
        let first = events[0].event_id;
        for (i, e) in events.iter().enumerate() {
            if e.event_id != first + i as i64 {
                return Err(DeciderError::NonDeterministic(format!(
                    "history event ids are not contiguous: expected {}, got {} at position {}",
                    first + i as i64,
                    e.event_id,
                    i
                )));
            }
        }
        Ok(Self {
            events,
            pos: 0,
            exhausted: false,
        })
    }

    fn peek(&self, offset: usize) -> Option<&'a HistoryEvent> {
        self.events.get(self.pos + offset)
    }

    /// Collect the run of command records directly following a
    /// `WorkflowTaskCompleted`.
    fn take_command_events(&mut self) -> Vec<HistoryEvent> {
        let mut out = Vec::new();
        while let Some(e) = self.peek(0) {
            if !e.is_command_event() {
                break;
            }
            out.push(e.clone());
            self.pos += 1;
        }
        out
    }

    /// Produce the next workflow-task slice, or `None` at end of stream.
    pub fn next_slice(&mut self) -> Result<Option<WorkflowTaskSlice>, DeciderError> {
        if self.exhausted || self.pos >= self.events.len() {
            return Ok(None);
        }

        let mut acc: Vec<HistoryEvent> = Vec::new();
        let mut replay_time_ms = 0i64;

        while let Some(event) = self.peek(0) {
            match &event.attributes {
                EventAttributes::WorkflowTaskStarted { .. } => {
                    match self.peek(1).map(|e| &e.attributes) {
                        Some(EventAttributes::WorkflowTaskFailed { .. })
                        | Some(EventAttributes::WorkflowTaskTimedOut { .. }) => {
                            // The task never happened. Drop its scheduled
                            // event from the accumulator and keep going.
                            debug!(
                                started_event_id = event.event_id,
                                "discarding failed or timed out workflow task"
                            );
                            if matches!(
                                acc.last().map(|e| &e.attributes),
                                Some(EventAttributes::WorkflowTaskScheduled)
                            ) {
                                acc.pop();
                            }
                            self.pos += 2;
                        }
                        Some(EventAttributes::WorkflowTaskCompleted { .. }) => {
                            replay_time_ms = event.timestamp.timestamp_millis();
                            acc.push(event.clone());
                            let completed_id = self.peek(1).map(|e| e.event_id).unwrap_or(0);
                            self.pos += 2;
                            let command_events = self.take_command_events();
                            return Ok(Some(WorkflowTaskSlice {
                                events: acc,
                                command_events,
                                replay: true,
                                replay_time_ms,
                                next_command_event_id: completed_id + 1,
                            }));
                        }
                        None => {
                            // Freshest task: the stream ends at its started
                            // event. Reserve space for the completion record
                            // the server is about to write.
                            replay_time_ms = event.timestamp.timestamp_millis();
                            let started_id = event.event_id;
                            acc.push(event.clone());
                            self.pos += 1;
                            self.exhausted = true;
                            return Ok(Some(WorkflowTaskSlice {
                                events: acc,
                                command_events: Vec::new(),
                                replay: false,
                                replay_time_ms,
                                next_command_event_id: started_id + 2,
                            }));
                        }
                        Some(other) => {
                            return Err(DeciderError::NonDeterministic(format!(
                                "unexpected {} after WorkflowTaskStarted at event {}",
                                other.name(),
                                event.event_id
                            )));
                        }
                    }
                }
                EventAttributes::WorkflowTaskCompleted { .. } => {
                    // Sticky-queue page beginning at the previous task's
                    // completion: the slice has no new events, only the
                    // commands that completion recorded.
                    let completed_id = event.event_id;
                    self.pos += 1;
                    let command_events = self.take_command_events();
                    return Ok(Some(WorkflowTaskSlice {
                        events: acc,
                        command_events,
                        replay: true,
                        replay_time_ms,
                        next_command_event_id: completed_id + 1,
                    }));
                }
                _ => {
                    acc.push(event.clone());
                    self.pos += 1;
                }
            }
        }

        // Trailing events with no workflow task behind them, e.g. signals
        // recorded after the last completed task of a finished run.
        self.exhausted = true;
        if acc.is_empty() {
            Ok(None)
        } else {
            let next = acc.last().map(|e| e.event_id + 1).unwrap_or(1);
            Ok(Some(WorkflowTaskSlice {
                events: acc,
                command_events: Vec::new(),
                replay: true,
                replay_time_ms,
                next_command_event_id: next,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHistoryBuilder;
    use windward_types::Payload;

    #[test]
    fn single_fresh_task() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_workflow_task_scheduled_and_started();

        let events = t.events().to_vec();
        let mut slices = HistorySlices::new(&events).unwrap();
        let s = slices.next_slice().unwrap().unwrap();
        assert_eq!(s.events.len(), 3);
        assert!(!s.replay);
        // Started is event 3; completion will be 4, first command 5.
        assert_eq!(s.next_command_event_id, 5);
        assert!(slices.next_slice().unwrap().is_none());
    }

    #[test_log::test]
    fn replayed_task_collects_trailing_command_events() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        let timer_started = t.add_timer_started("0", 10_000);
        t.add_timer_fired(timer_started, "0");
        t.add_workflow_task_scheduled_and_started();

        let events = t.events().to_vec();
        let mut slices = HistorySlices::new(&events).unwrap();

        let first = slices.next_slice().unwrap().unwrap();
        assert!(first.replay);
        assert_eq!(first.next_command_event_id, 5);
        assert_eq!(first.command_events.len(), 1);
        assert_eq!(first.command_events[0].event_id, timer_started);

        let second = slices.next_slice().unwrap().unwrap();
        assert!(!second.replay);
        // TimerFired, WorkflowTaskScheduled, WorkflowTaskStarted.
        assert_eq!(second.events.len(), 3);
        assert_eq!(second.next_command_event_id, 8 + 2);
        assert!(slices.next_slice().unwrap().is_none());
    }

    #[test]
    fn failed_task_is_discarded() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_failed_workflow_task();
        t.add_workflow_task_scheduled_and_started();

        let events = t.events().to_vec();
        let mut slices = HistorySlices::new(&events).unwrap();
        let s = slices.next_slice().unwrap().unwrap();
        // The failed task's scheduled/started/failed triple is gone.
        assert_eq!(s.events.len(), 3);
        assert_eq!(s.events[0].event_id, 1);
        assert!(!s.replay);
    }

    #[test]
    fn sticky_page_starting_at_completed() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        let timer_started = t.add_timer_started("0", 1_000);
        t.add_timer_fired(timer_started, "0");
        t.add_workflow_task_scheduled_and_started();

        // Simulate the sticky page: drop everything before the completion.
        let events: Vec<_> = t
            .events()
            .iter()
            .filter(|e| e.event_id >= 4)
            .cloned()
            .collect();
        let mut slices = HistorySlices::new(&events).unwrap();

        let first = slices.next_slice().unwrap().unwrap();
        assert!(first.events.is_empty());
        assert_eq!(first.command_events.len(), 1);
        assert_eq!(first.next_command_event_id, 5);

        let second = slices.next_slice().unwrap().unwrap();
        assert!(!second.replay);
    }

    #[test]
    fn finished_history_yields_only_replay_slices() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        t.add_workflow_completed(Some(Payload::json(&1u8).unwrap()));

        let events = t.events().to_vec();
        let mut slices = HistorySlices::new(&events).unwrap();
        let s = slices.next_slice().unwrap().unwrap();
        assert!(s.replay);
        assert_eq!(s.command_events.len(), 1);
        assert!(slices.next_slice().unwrap().is_none());
    }

    #[test]
    fn gapped_event_ids_are_fatal() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_workflow_task_scheduled_and_started();
        let mut events = t.events().to_vec();
        events[2].event_id = 9;
        assert!(matches!(
            HistorySlices::new(&events),
            Err(DeciderError::NonDeterministic(_))
        ));
    }

    #[test]
    fn unexpected_event_after_started_is_fatal() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_workflow_task_scheduled_and_started();
        t.add_workflow_signaled("s", None);
        t.add_workflow_task_scheduled_and_started();

        let events = t.events().to_vec();
        let mut slices = HistorySlices::new(&events).unwrap();
        assert!(matches!(
            slices.next_slice(),
            Err(DeciderError::NonDeterministic(_))
        ));
    }
}
