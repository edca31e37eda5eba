use crate::core::CoreError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Error type activity functions may return.
///
/// Anything convertible into it (`String`, `&str`, any `std::error::Error`)
/// can be returned from an activity; the rendered message is what ends up
/// in the activity run's `error_message`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Kind of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    Workflow,
    Activity,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Workflow => f.write_str("workflow"),
            FunctionKind::Activity => f.write_str("activity"),
        }
    }
}

/// Errors raised by the function registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// A function with this name is already registered.
    #[error("{kind} {name} is already registered")]
    AlreadyRegistered { kind: FunctionKind, name: String },

    /// The name is empty, padded with whitespace, or too long.
    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: FunctionKind, name: String },

    /// The registry was sealed before this registration.
    #[error("cannot register {kind} {name}: registry is sealed")]
    Sealed { kind: FunctionKind, name: String },

    /// No function with this name is registered.
    #[error("{kind} {name} is not registered")]
    NotRegistered { kind: FunctionKind, name: String },

    /// The arguments do not fit the registered input type.
    #[error("invalid arguments for {kind} {name}: {reason}")]
    InvalidArguments {
        kind: FunctionKind,
        name: String,
        reason: String,
    },
}

/// How the recorded history disagrees with the workflow code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HistoryMismatch {
    /// The workflow called a different activity than the one recorded.
    #[error("workflow called {expected}, history recorded {recorded}")]
    Name { expected: String, recorded: String },

    /// The workflow called the recorded activity with different arguments.
    #[error("{activity} called with {current}, history recorded {recorded}")]
    Input {
        activity: String,
        recorded: String,
        current: String,
    },
}

/// Errors returned by workflow functions and by
/// [`ReplayContext::execute_activity`](super::ReplayContext::execute_activity).
///
/// Two variants are suspension signals rather than failures:
/// [`WorkflowError::ActivitySchedulingNeeded`] and
/// [`WorkflowError::ActivityInFlight`]. Workflow code propagates them with
/// `?` and the worker parks the run until the activity settles. Use
/// [`WorkflowError::is_suspension`] to tell them apart; never match on the
/// message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// The workflow diverged from its recorded history.
    #[error("history mismatch at position {position}: {mismatch}")]
    HistoryMismatch {
        position: usize,
        #[source]
        mismatch: HistoryMismatch,
    },

    /// A new activity run was recorded; the run must wait for it.
    #[error("activity {activity} scheduled as {activity_run_id}")]
    ActivitySchedulingNeeded {
        activity: String,
        activity_run_id: String,
    },

    /// The recorded activity run has not settled yet.
    #[error("activity {activity} still in flight as {activity_run_id}")]
    ActivityInFlight {
        activity: String,
        activity_run_id: String,
    },

    /// The recorded activity run failed.
    #[error("activity {activity} failed: {message}")]
    ActivityFailed { activity: String, message: String },

    /// The worker has no function registered under the run's workflow name.
    #[error("workflow {0} is not registered")]
    NotRegistered(String),

    /// The stored input does not fit the workflow's input type.
    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    /// The context was used after its attempt ended.
    #[error("replay context is closed")]
    ContextClosed,

    /// Workflow-defined failure.
    #[error("workflow failed: {0}")]
    Failed(String),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl WorkflowError {
    /// Creates a workflow-defined failure.
    pub fn failed(message: impl fmt::Display) -> Self {
        WorkflowError::Failed(message.to_string())
    }

    /// Returns true for the two signals that park a run instead of ending it.
    pub fn is_suspension(&self) -> bool {
        self.suspend_reason().is_some()
    }

    /// Returns why the run should be parked, if this is a suspension signal.
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        match self {
            WorkflowError::ActivitySchedulingNeeded {
                activity,
                activity_run_id,
            } => Some(SuspendReason::ActivityScheduled {
                activity: activity.clone(),
                activity_run_id: activity_run_id.clone(),
            }),
            WorkflowError::ActivityInFlight {
                activity,
                activity_run_id,
            } => Some(SuspendReason::ActivityInFlight {
                activity: activity.clone(),
                activity_run_id: activity_run_id.clone(),
            }),
            _ => None,
        }
    }

    /// Returns true if the run can never succeed with the code this worker
    /// runs. Such runs are aborted rather than failed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::HistoryMismatch { .. }
                | WorkflowError::NotRegistered(_)
                | WorkflowError::InvalidInput(_)
        )
    }
}

impl From<String> for WorkflowError {
    fn from(s: String) -> Self {
        WorkflowError::Failed(s)
    }
}

impl From<&str> for WorkflowError {
    fn from(s: &str) -> Self {
        WorkflowError::Failed(s.to_string())
    }
}

/// Reason why a run suspended execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspendReason {
    /// A new activity run was recorded during this attempt.
    ActivityScheduled {
        activity: String,
        activity_run_id: String,
    },
    /// A previously recorded activity run has not settled yet.
    ActivityInFlight {
        activity: String,
        activity_run_id: String,
    },
}

/// Result of a run attempt that did not fail. Failures travel as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The workflow returned; carries its JSON output.
    Finished(Value),
    /// The workflow is waiting on an activity.
    Suspended(SuspendReason),
    /// The worker's lease lapsed and another worker owns the run now; the
    /// attempt was discarded.
    LeaseLost,
}

// =============================================================================
// RETRYABLE ERROR TRAIT
// =============================================================================

/// Trait for error types to specify whether they are transient.
///
/// # Example
///
/// ```rust
/// use waypost::executor::Retryable;
///
/// #[derive(Debug)]
/// enum PaymentError {
///     NetworkTimeout,
///     InsufficientFunds,
/// }
///
/// impl Retryable for PaymentError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, PaymentError::NetworkTimeout)
///     }
/// }
/// ```
pub trait Retryable {
    /// Returns true if this error is transient and the operation may be
    /// attempted again unchanged.
    fn is_retryable(&self) -> bool;
}

impl<T: Retryable> Retryable for Box<T> {
    fn is_retryable(&self) -> bool {
        (**self).is_retryable()
    }
}

impl<T: Retryable> Retryable for std::sync::Arc<T> {
    fn is_retryable(&self) -> bool {
        (**self).is_retryable()
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Only transient storage faults are retryable: the run is released back to
/// `pending` and picked up again later. Everything else, including a
/// constraint violation or a missing row, would fail again on replay.
impl Retryable for WorkflowError {
    fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Formats a JSON payload as a short preview for error messages.
///
/// Long payloads are cut and tagged with their stable hash so two previews
/// can still be told apart.
pub(super) fn format_payload_preview(value: &Value) -> String {
    const MAX_CHARS: usize = 64;
    let rendered = value.to_string();
    if rendered.chars().count() <= MAX_CHARS {
        return rendered;
    }

    let head: String = rendered.chars().take(MAX_CHARS).collect();
    format!("{head}... (hash {:016x})", crate::core::hash_value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suspension_is_decided_by_kind() {
        let scheduled = WorkflowError::ActivitySchedulingNeeded {
            activity: "add".into(),
            activity_run_id: "id".into(),
        };
        let in_flight = WorkflowError::ActivityInFlight {
            activity: "add".into(),
            activity_run_id: "id".into(),
        };
        let lookalike = WorkflowError::failed("activity add scheduled as id");

        assert!(scheduled.is_suspension());
        assert!(in_flight.is_suspension());
        assert!(!lookalike.is_suspension());
    }

    #[test]
    fn test_fatal_and_retryable() {
        let mismatch = WorkflowError::HistoryMismatch {
            position: 0,
            mismatch: HistoryMismatch::Name {
                expected: "b".into(),
                recorded: "a".into(),
            },
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.is_retryable());

        let storage = WorkflowError::from(StorageError::Connection("down".into()));
        assert!(!storage.is_fatal());
        assert!(storage.is_retryable());

        let constraint = WorkflowError::from(StorageError::Constraint("duplicate".into()));
        assert!(!constraint.is_fatal());
        assert!(!constraint.is_retryable());

        let missing = WorkflowError::from(StorageError::WorkflowRunNotFound("x".into()));
        assert!(!missing.is_retryable());

        assert!(!WorkflowError::from("boom").is_fatal());
    }

    #[test]
    fn test_payload_preview_truncates_long_values() {
        assert_eq!(format_payload_preview(&json!(["test", 42])), r#"["test",42]"#);

        let long = json!(["x".repeat(200)]);
        let preview = format_payload_preview(&long);
        assert!(preview.contains("... (hash "));
        assert!(preview.len() < 120);
    }
}
