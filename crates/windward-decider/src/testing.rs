//! Test support: build well-formed histories event by event.
//!
//! Only enforces enough structure to produce valid histories (contiguous
//! ids, workflow-task bookkeeping); semantic validity is the test author's
//! job.

use anyhow::{anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use windward_types::event::{EventAttributes, HistoryEvent};
use windward_types::marker::{
    LOCAL_ACTIVITY_MARKER_NAME, LocalActivityMarkerData, MUTABLE_SIDE_EFFECT_MARKER_NAME,
    MarkerData, MutableMarkerHeader, SIDE_EFFECT_MARKER_NAME, VERSION_MARKER_NAME,
};
use windward_types::task::WorkflowTask;
use windward_types::{Failure, Payload, WorkflowExecution};

/// Base wall clock for built histories: 2024-01-01T00:00:00Z.
pub const TEST_EPOCH_MS: i64 = 1_704_067_200_000;

/// Incrementally builds a history, assigning contiguous 1-based event ids.
#[derive(Clone, Debug)]
pub struct TestHistoryBuilder {
    events: Vec<HistoryEvent>,
    now_ms: i64,
    pending_task_scheduled_id: i64,
}

impl Default for TestHistoryBuilder {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            now_ms: TEST_EPOCH_MS,
            pending_task_scheduled_id: 0,
        }
    }
}

impl TestHistoryBuilder {
    /// Advance the builder's wall clock; later events carry the new time.
    pub fn advance_time(&mut self, ms: i64) {
        self.now_ms += ms;
    }

    pub fn events(&self) -> &[HistoryEvent] {
        &self.events
    }

    fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms).unwrap()
    }

    /// Append an event and return its id.
    pub fn add(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.events.len() as i64 + 1;
        self.events.push(HistoryEvent {
            event_id,
            timestamp: self.timestamp(),
            attributes,
        });
        event_id
    }

    pub fn add_workflow_started(&mut self, workflow_type: &str) -> i64 {
        self.add(EventAttributes::WorkflowStarted {
            workflow_type: workflow_type.to_string(),
            input: None,
            original_run_id: "test-run".to_string(),
            task_queue: "test-queue".to_string(),
            workflow_task_timeout_ms: 10_000,
        })
    }

    pub fn add_workflow_task_scheduled(&mut self) -> i64 {
        let id = self.add(EventAttributes::WorkflowTaskScheduled);
        self.pending_task_scheduled_id = id;
        id
    }

    pub fn add_workflow_task_started(&mut self) -> i64 {
        let scheduled = self.pending_task_scheduled_id;
        self.add(EventAttributes::WorkflowTaskStarted {
            scheduled_event_id: scheduled,
        })
    }

    pub fn add_workflow_task_completed(&mut self) -> i64 {
        let scheduled = self.pending_task_scheduled_id;
        self.add(EventAttributes::WorkflowTaskCompleted {
            scheduled_event_id: scheduled,
            started_event_id: scheduled + 1,
        })
    }

    /// Scheduled + started + completed, the shape of every replayed task.
    pub fn add_full_workflow_task(&mut self) {
        self.add_workflow_task_scheduled();
        self.add_workflow_task_started();
        self.add_workflow_task_completed();
    }

    /// Scheduled + started, the shape of the freshest task.
    pub fn add_workflow_task_scheduled_and_started(&mut self) {
        self.add_workflow_task_scheduled();
        self.add_workflow_task_started();
    }

    /// Scheduled + started + failed; the slicer must discard all three.
    pub fn add_failed_workflow_task(&mut self) {
        let scheduled = self.add_workflow_task_scheduled();
        self.add_workflow_task_started();
        self.add(EventAttributes::WorkflowTaskFailed {
            scheduled_event_id: scheduled,
            cause: "test failure".to_string(),
        });
    }

    pub fn add_timer_started(&mut self, timer_id: &str, timeout_ms: i64) -> i64 {
        self.add(EventAttributes::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_ms: timeout_ms,
        })
    }

    pub fn add_timer_fired(&mut self, started_event_id: i64, timer_id: &str) -> i64 {
        self.add(EventAttributes::TimerFired {
            started_event_id,
            timer_id: timer_id.to_string(),
        })
    }

    pub fn add_timer_canceled(&mut self, started_event_id: i64, timer_id: &str) -> i64 {
        self.add(EventAttributes::TimerCanceled {
            started_event_id,
            timer_id: timer_id.to_string(),
        })
    }

    pub fn add_activity_scheduled(&mut self, activity_id: &str, activity_type: &str) -> i64 {
        self.add(EventAttributes::ActivityScheduled {
            activity_id: activity_id.to_string(),
            activity_type: activity_type.to_string(),
            task_queue: "test-queue".to_string(),
            input: None,
        })
    }

    pub fn add_activity_started(&mut self, scheduled_event_id: i64) -> i64 {
        self.add(EventAttributes::ActivityStarted {
            scheduled_event_id,
            attempt: 1,
        })
    }

    pub fn add_activity_completed(
        &mut self,
        scheduled_event_id: i64,
        result: Option<Payload>,
    ) -> i64 {
        self.add(EventAttributes::ActivityCompleted {
            scheduled_event_id,
            result,
        })
    }

    pub fn add_activity_failed(&mut self, scheduled_event_id: i64, failure: Failure) -> i64 {
        self.add(EventAttributes::ActivityFailed {
            scheduled_event_id,
            failure,
        })
    }

    pub fn add_activity_cancel_requested(&mut self, scheduled_event_id: i64) -> i64 {
        self.add(EventAttributes::ActivityCancelRequested { scheduled_event_id })
    }

    pub fn add_activity_canceled(&mut self, scheduled_event_id: i64) -> i64 {
        self.add(EventAttributes::ActivityCanceled {
            scheduled_event_id,
            details: None,
        })
    }

    pub fn add_marker_recorded(&mut self, marker: MarkerData) -> i64 {
        self.add(EventAttributes::MarkerRecorded(marker))
    }

    /// Side-effect marker carrying a recorded value.
    pub fn add_side_effect_marker(&mut self, value: Payload) -> i64 {
        self.add_marker_recorded(MarkerData::new(SIDE_EFFECT_MARKER_NAME, Some(value)))
    }

    /// Version marker for `change_id`. The header's event id is the id the
    /// marker itself receives.
    pub fn add_version_marker(&mut self, change_id: &str, version: i32, access_count: u32) -> i64 {
        let event_id = self.events.len() as i64 + 1;
        self.add_marker_recorded(
            MarkerData::new(
                VERSION_MARKER_NAME,
                Some(Payload::json(&version).expect("version encodes")),
            )
            .with_header(MutableMarkerHeader {
                id: change_id.to_string(),
                event_id,
                access_count,
            }),
        )
    }

    pub fn add_mutable_side_effect_marker(
        &mut self,
        id: &str,
        value: Payload,
        access_count: u32,
    ) -> i64 {
        let event_id = self.events.len() as i64 + 1;
        self.add_marker_recorded(
            MarkerData::new(MUTABLE_SIDE_EFFECT_MARKER_NAME, Some(value)).with_header(
                MutableMarkerHeader {
                    id: id.to_string(),
                    event_id,
                    access_count,
                },
            ),
        )
    }

    pub fn add_local_activity_marker(&mut self, data: &LocalActivityMarkerData) -> i64 {
        self.add_marker_recorded(MarkerData::new(
            LOCAL_ACTIVITY_MARKER_NAME,
            Some(Payload::json(data).expect("marker data encodes")),
        ))
    }

    pub fn add_child_initiated(&mut self, workflow_id: &str, workflow_type: &str) -> i64 {
        self.add(EventAttributes::ChildWorkflowInitiated {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
        })
    }

    pub fn add_child_started(&mut self, initiated_event_id: i64, run_id: &str) -> i64 {
        self.add(EventAttributes::ChildWorkflowStarted {
            initiated_event_id,
            run_id: run_id.to_string(),
        })
    }

    pub fn add_child_completed(&mut self, initiated_event_id: i64, result: Option<Payload>) -> i64 {
        self.add(EventAttributes::ChildWorkflowCompleted {
            initiated_event_id,
            result,
        })
    }

    pub fn add_child_canceled(&mut self, initiated_event_id: i64) -> i64 {
        self.add(EventAttributes::ChildWorkflowCanceled {
            initiated_event_id,
            details: None,
        })
    }

    pub fn add_signal_external_initiated(
        &mut self,
        execution: WorkflowExecution,
        signal_name: &str,
    ) -> i64 {
        self.add(EventAttributes::SignalExternalInitiated {
            execution,
            signal_name: signal_name.to_string(),
        })
    }

    pub fn add_external_signaled(&mut self, initiated_event_id: i64) -> i64 {
        self.add(EventAttributes::ExternalSignaled { initiated_event_id })
    }

    pub fn add_cancel_external_initiated(&mut self, execution: WorkflowExecution) -> i64 {
        self.add(EventAttributes::CancelExternalInitiated { execution })
    }

    pub fn add_external_cancel_requested(&mut self, initiated_event_id: i64) -> i64 {
        self.add(EventAttributes::ExternalCancelRequested { initiated_event_id })
    }

    pub fn add_workflow_signaled(&mut self, signal_name: &str, input: Option<Payload>) -> i64 {
        self.add(EventAttributes::WorkflowSignaled {
            signal_name: signal_name.to_string(),
            input,
        })
    }

    pub fn add_workflow_cancel_requested(&mut self) -> i64 {
        self.add(EventAttributes::WorkflowCancelRequested { reason: None })
    }

    pub fn add_workflow_completed(&mut self, result: Option<Payload>) -> i64 {
        self.add(EventAttributes::WorkflowCompleted { result })
    }

    pub fn add_workflow_failed(&mut self, failure: Failure) -> i64 {
        self.add(EventAttributes::WorkflowFailed { failure })
    }

    /// The `(previous_started, started)` pair a poll response would carry
    /// for this history. A history that ends mid-run points `started` at the
    /// trailing `WorkflowTaskStarted`; a finished history pretends the final
    /// task was already the previous one, which is what the server reports
    /// when a complete history is replayed.
    fn started_ids(&self) -> anyhow::Result<(i64, i64)> {
        let mut previous = 0i64;
        let mut started = 0i64;
        let mut iter = self.events.iter().peekable();
        while let Some(e) = iter.next() {
            if matches!(e.attributes, EventAttributes::WorkflowTaskStarted { .. }) {
                let next = iter.peek();
                let completed = matches!(
                    next.map(|n| &n.attributes),
                    Some(EventAttributes::WorkflowTaskCompleted { .. })
                );
                if completed || next.is_none() {
                    previous = started;
                    started = e.event_id;
                }
            }
        }
        if started == 0 {
            bail!("history has no workflow task started event");
        }
        let finished = self
            .events
            .last()
            .map(|e| e.is_final_workflow_event())
            .unwrap_or(false);
        if finished {
            // Complete history: replaying it has nothing fresh to execute.
            previous = started;
        }
        Ok((previous, started))
    }

    /// Package the whole history as an inbound workflow task.
    pub fn as_workflow_task(&self, execution: &WorkflowExecution) -> anyhow::Result<WorkflowTask> {
        let (previous_started_event_id, started_event_id) = self.started_ids()?;
        let workflow_type = match &self
            .events
            .first()
            .ok_or(anyhow!("history is empty"))?
            .attributes
        {
            EventAttributes::WorkflowStarted { workflow_type, .. } => workflow_type.clone(),
            other => bail!("first event must be WorkflowStarted, got {}", other.name()),
        };
        Ok(WorkflowTask {
            task_token: vec![0xfe, 0xed],
            execution: execution.clone(),
            workflow_type,
            history: self.events.clone(),
            previous_started_event_id,
            started_event_id,
            query: None,
            next_page_token: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_contiguous_from_one() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        let timer = t.add_timer_started("0", 1_000);
        assert_eq!(timer, 5);
        let ids: Vec<_> = t.events().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn started_ids_track_the_latest_completed_or_final_task() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        t.add_workflow_task_scheduled_and_started();
        let task = t
            .as_workflow_task(&WorkflowExecution::new("wf", "run"))
            .unwrap();
        assert_eq!(task.previous_started_event_id, 3);
        assert_eq!(task.started_event_id, 6);
    }

    #[test]
    fn finished_history_reports_itself_as_fully_replayed() {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("wf");
        t.add_full_workflow_task();
        t.add_workflow_completed(None);
        let task = t
            .as_workflow_task(&WorkflowExecution::new("wf", "run"))
            .unwrap();
        assert_eq!(task.previous_started_event_id, task.started_event_id);
    }
}
