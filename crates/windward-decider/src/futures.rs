//! The single "future" primitive every suspension point resolves through.
//!
//! A slot is `Pending` until the decider resolves it from a history event,
//! a marker, or an immediate cancellation. Cancellation is not a separate
//! state: it is a `Failure` whose kind is `Canceled`, so every awaiting
//! coroutine handles it through the same arm as any other failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use windward_types::{Failure, Payload};

use crate::state::WfState;

/// Index into the run's slot table. Slots are never reused within a run.
pub(crate) type FutureHandle = usize;

/// Outcome every SDK future resolves to before adapters shape it.
pub type OpResult = Result<Option<Payload>, Failure>;

#[derive(Debug)]
pub(crate) enum SlotState {
    Pending,
    Ready(OpResult),
}

#[derive(Debug)]
pub(crate) struct FutureSlot {
    pub(crate) state: SlotState,
    pub(crate) waker: Option<Waker>,
}

impl FutureSlot {
    pub(crate) fn pending() -> Self {
        Self {
            state: SlotState::Pending,
            waker: None,
        }
    }

    pub(crate) fn ready(result: OpResult) -> Self {
        Self {
            state: SlotState::Ready(result),
            waker: None,
        }
    }

    /// Resolve the slot and wake whichever coroutine is parked on it.
    /// Resolving twice is a no-op; the first result wins.
    pub(crate) fn resolve(&mut self, result: OpResult) {
        if matches!(self.state, SlotState::Ready(_)) {
            return;
        }
        self.state = SlotState::Ready(result);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Future over one slot. Cloning the result on completion keeps the slot
/// readable for late observers (e.g. a cancel racing a completion).
pub struct WfFuture {
    pub(crate) handle: FutureHandle,
    pub(crate) shared: Arc<Mutex<WfState>>,
}

/// Shared poll body for every slot-backed future in the SDK.
pub(crate) fn poll_slot(
    shared: &Arc<Mutex<WfState>>,
    handle: FutureHandle,
    cx: &mut Context<'_>,
) -> Poll<OpResult> {
    let mut state = shared.lock().expect("workflow state lock");
    let slot = &mut state.slots[handle];
    match &slot.state {
        SlotState::Ready(result) => Poll::Ready(result.clone()),
        SlotState::Pending => {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Future for WfFuture {
    type Output = OpResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_slot(&self.shared, self.handle, cx)
    }
}
