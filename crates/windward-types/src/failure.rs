use serde::{Deserialize, Serialize};
use std::fmt;

use crate::payload::Payload;

/// Canonical category for a failure that crosses a component boundary.
///
/// Coarse-grained on purpose: the kind drives policy (retry, task-fail vs
/// workflow-fail) and observability dimensions, not user-facing detail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Workflow or activity code returned an application error.
    Application,
    /// An activity invocation failed, timed out, or was canceled.
    ///
    /// Surfaces at the awaiting future; subject to the activity retry policy.
    Activity,
    /// A child workflow returned failure or exceeded its run timeout.
    ChildWorkflow,
    /// Signal delivery to an external workflow failed.
    SignalExternal,
    /// Cancel delivery to an external workflow failed.
    CancelExternal,
    /// An operation exceeded one of its configured timeouts.
    Timeout(TimeoutKind),
    /// Cooperative cancellation flowed through a scope.
    ///
    /// A control-flow outcome, not necessarily a fault.
    Canceled,
    /// Replay divergence was detected. Fatal to the workflow task.
    NonDeterminism,
}

/// Which timeout fired for a timed-out operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutKind {
    ScheduleToStart,
    ScheduleToClose,
    StartToClose,
    Heartbeat,
}

/// Structured failure payload shared by activities, child workflows, and the
/// workflow itself.
///
/// Replaces raw string errors with a stable shape that is easy to classify
/// (`kind`), render (`message`), and chain (`cause`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Optional diagnostic detail for deep triage. Omit when nothing extra
    /// exists.
    pub detail: Option<String>,
    /// Encoded application-level failure details, if any.
    pub payload: Option<Payload>,
    /// The failure that caused this one, if chained across a boundary.
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            payload: None,
            cause: None,
        }
    }

    /// Application-level failure from workflow or activity code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message)
    }

    /// The standard cancellation outcome delivered to futures attached to a
    /// canceled scope or operation.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Canceled, message)
    }

    pub fn timeout(kind: TimeoutKind) -> Self {
        Self::new(
            FailureKind::Timeout(kind),
            format!("operation timed out: {kind:?}"),
        )
    }

    /// Adds or replaces the optional diagnostic detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn caused_by(mut self, cause: Failure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.kind, FailureKind::Canceled)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(ref detail) = self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(ref cause) = self.cause {
            write!(f, "; caused by {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}
