//! Deterministic cooperative scheduler for workflow coroutines.
//!
//! One thread, no timers, no IO: the runner polls each ready coroutine in
//! creation order until every coroutine is blocked on a future slot. Wakes
//! happen synchronously when the decider resolves slots, so "ready" is a
//! plain flag per task and quiescence is simply "no flags set". Replays are
//! byte-identical because nothing here depends on wall time, thread timing,
//! or hash order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::task::{ArcWake, waker};

struct ReadyFlag(AtomicBool);

impl ArcWake for ReadyFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

struct RunnerTask {
    name: String,
    /// `None` once the coroutine has completed.
    fut: Option<BoxFuture<'static, ()>>,
    flag: Arc<ReadyFlag>,
}

/// Single-threaded poll loop over the run's coroutines.
#[derive(Default)]
pub(crate) struct DeterministicRunner {
    tasks: Vec<RunnerTask>,
}

impl DeterministicRunner {
    /// Adopt a coroutine. It starts ready and is polled on the next pass.
    pub(crate) fn add_task(&mut self, name: String, fut: BoxFuture<'static, ()>) {
        self.tasks.push(RunnerTask {
            name,
            fut: Some(fut),
            flag: Arc::new(ReadyFlag(AtomicBool::new(true))),
        });
    }

    /// Poll ready coroutines, in creation order, until all are blocked.
    /// Returns whether anything was polled at all.
    pub(crate) fn run_until_blocked(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut any = false;
            for task in self.tasks.iter_mut() {
                let Some(fut) = task.fut.as_mut() else {
                    continue;
                };
                if !task.flag.0.swap(false, Ordering::SeqCst) {
                    continue;
                }
                any = true;
                progressed = true;
                let waker = waker(task.flag.clone());
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(()) = fut.as_mut().poll(&mut cx) {
                    tracing::debug!(task = %task.name, "workflow coroutine finished");
                    task.fut = None;
                }
            }
            if !any {
                break;
            }
        }
        progressed
    }

    /// True while any coroutine has a pending wake.
    pub(crate) fn has_ready_tasks(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.fut.is_some() && t.flag.0.load(Ordering::SeqCst))
    }

    /// Drop every coroutine. Used on decider close and cache eviction.
    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }

    #[cfg(test)]
    pub(crate) fn live_task_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.fut.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::sync::Mutex;

    #[test]
    fn polls_in_creation_order_until_quiescent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut runner = DeterministicRunner::default();

        for i in 0..3 {
            let order = order.clone();
            runner.add_task(
                format!("t{i}"),
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                }),
            );
        }

        assert!(runner.run_until_blocked());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(runner.live_task_count(), 0);
        // Everything completed; a second pass has nothing to do.
        assert!(!runner.run_until_blocked());
    }

    #[test]
    fn blocked_tasks_stay_parked_until_woken() {
        let gate = Arc::new(AtomicBool::new(false));
        let woken = Arc::new(Mutex::new(None));
        let mut runner = DeterministicRunner::default();

        let gate2 = gate.clone();
        let woken2 = woken.clone();
        runner.add_task(
            "gated".into(),
            Box::pin(poll_fn(move |cx| {
                if gate2.load(Ordering::SeqCst) {
                    Poll::Ready(())
                } else {
                    *woken2.lock().unwrap() = Some(cx.waker().clone());
                    Poll::Pending
                }
            })),
        );

        assert!(runner.run_until_blocked());
        assert_eq!(runner.live_task_count(), 1);
        assert!(!runner.has_ready_tasks());

        gate.store(true, Ordering::SeqCst);
        woken.lock().unwrap().take().unwrap().wake();
        assert!(runner.has_ready_tasks());
        assert!(runner.run_until_blocked());
        assert_eq!(runner.live_task_count(), 0);
    }
}
