//! Replay and activity contexts.
//!
//! A [`ReplayContext`] is created by the workflow worker for one execution
//! attempt of one workflow run. It holds the run's recorded history, a
//! cursor into it, and the attempt's open transaction. Workflow code threads
//! it through every [`ReplayContext::execute_activity`] call.
//!
//! An [`ActivityContext`] is handed to activity functions by the activity
//! worker.

use super::error::{format_payload_preview, HistoryMismatch, SuspendReason, WorkflowError};
use super::registry::ActivityRef;
use crate::core::{
    deserialize_value, payloads_equal, serialize_value, ActivityRun, ActivityStatus,
};
use crate::storage::RunTransaction;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Mutable replay state, guarded as a whole so concurrent
/// `execute_activity` calls observe and advance the cursor one at a time.
struct ReplayCursor {
    position: usize,
    /// Taken back by the worker when the attempt ends.
    tx: Option<Box<dyn RunTransaction>>,
    /// Set once this attempt recorded a new activity run.
    scheduled: Option<(String, String)>,
}

struct ReplayState {
    workflow_run_id: String,
    history: Vec<ActivityRun>,
    cursor: Mutex<ReplayCursor>,
}

/// Execution context for one attempt of one workflow run.
///
/// Cloning is cheap; clones share the cursor.
///
/// # Determinism
///
/// Every attempt re-runs the workflow from the top. The n-th
/// `execute_activity` call of an attempt is answered from the n-th entry of
/// the recorded history, so the sequence of activity names and arguments
/// must be a pure function of the workflow input and earlier activity
/// results. Reading clocks, random numbers or the environment directly in
/// workflow code breaks replay; do it in an activity instead.
///
/// Awaiting several `execute_activity` futures concurrently (e.g. with
/// `tokio::join!`) is not supported: their order in history would depend
/// on polling order.
#[derive(Clone)]
pub struct ReplayContext {
    inner: Arc<ReplayState>,
}

impl ReplayContext {
    /// Creates a context over `history` that records new activity runs in
    /// `tx`.
    pub fn new(
        workflow_run_id: impl Into<String>,
        history: Vec<ActivityRun>,
        tx: Box<dyn RunTransaction>,
    ) -> Self {
        Self {
            inner: Arc::new(ReplayState {
                workflow_run_id: workflow_run_id.into(),
                history,
                cursor: Mutex::new(ReplayCursor {
                    position: 0,
                    tx: Some(tx),
                    scheduled: None,
                }),
            }),
        }
    }

    /// ID of the workflow run being executed.
    pub fn workflow_run_id(&self) -> &str {
        &self.inner.workflow_run_id
    }

    /// Number of recorded history entries this attempt replays against.
    pub fn history_len(&self) -> usize {
        self.inner.history.len()
    }

    /// Index of the history entry the next `execute_activity` call consumes.
    pub async fn position(&self) -> usize {
        self.inner.cursor.lock().await.position
    }

    /// Returns true while calls are still being answered from history.
    pub async fn is_replaying(&self) -> bool {
        self.position().await < self.history_len()
    }

    /// Executes an activity through the history.
    ///
    /// - If history has an entry at the cursor, its name and input must
    ///   match this call, or [`WorkflowError::HistoryMismatch`] is returned
    ///   and the cursor stays put.
    ///   - A `finished` entry yields its recorded output.
    ///   - A `failed` entry yields [`WorkflowError::ActivityFailed`].
    ///   - Either way the cursor advances.
    ///   - A `pending` or `executing` entry yields
    ///     [`WorkflowError::ActivityInFlight`].
    /// - Past the end of history, a new `pending` activity run is recorded
    ///   and [`WorkflowError::ActivitySchedulingNeeded`] is returned.
    ///
    /// Both in-flight and scheduling-needed are suspension signals: return
    /// them from the workflow (`?` does that) and the run resumes once the
    /// activity settles. At most one new activity run is recorded per
    /// attempt; later calls in the same attempt return the same signal.
    pub async fn execute_activity<I, O>(
        &self,
        activity: &ActivityRef<I, O>,
        input: I,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let name = activity.name();
        let current = serialize_value(&input)?;
        let mut cursor = self.inner.cursor.lock().await;

        if let Some((scheduled, scheduled_run_id)) = &cursor.scheduled {
            return Err(WorkflowError::ActivitySchedulingNeeded {
                activity: scheduled.clone(),
                activity_run_id: scheduled_run_id.clone(),
            });
        }

        let position = cursor.position;
        if let Some(entry) = self.inner.history.get(position) {
            Self::validate_entry(position, entry, name, &current)?;

            return match entry.status {
                ActivityStatus::Finished => {
                    let output = deserialize_value(entry.output.clone().unwrap_or(Value::Null))?;
                    cursor.position += 1;
                    debug!(
                        "Replayed activity: run={}, position={}, activity={}",
                        self.inner.workflow_run_id, position, name
                    );
                    Ok(output)
                }
                ActivityStatus::Failed => {
                    cursor.position += 1;
                    Err(WorkflowError::ActivityFailed {
                        activity: name.to_string(),
                        message: entry
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    })
                }
                ActivityStatus::Pending | ActivityStatus::Executing => {
                    Err(WorkflowError::ActivityInFlight {
                        activity: name.to_string(),
                        activity_run_id: entry.id.clone(),
                    })
                }
            };
        }

        let run = ActivityRun::pending(&self.inner.workflow_run_id, name, current);
        let tx = cursor.tx.as_mut().ok_or(WorkflowError::ContextClosed)?;
        tx.activities().create_activity_run(&run).await?;

        debug!(
            "Scheduled activity: run={}, position={}, activity={}, activity_run={}",
            self.inner.workflow_run_id, position, name, run.id
        );

        cursor.scheduled = Some((name.to_string(), run.id.clone()));
        Err(WorkflowError::ActivitySchedulingNeeded {
            activity: name.to_string(),
            activity_run_id: run.id,
        })
    }

    fn validate_entry(
        position: usize,
        entry: &ActivityRun,
        name: &str,
        current: &Value,
    ) -> Result<(), WorkflowError> {
        if entry.activity_name != name {
            return Err(WorkflowError::HistoryMismatch {
                position,
                mismatch: HistoryMismatch::Name {
                    expected: name.to_string(),
                    recorded: entry.activity_name.clone(),
                },
            });
        }

        if !payloads_equal(&entry.input, current) {
            return Err(WorkflowError::HistoryMismatch {
                position,
                mismatch: HistoryMismatch::Input {
                    activity: name.to_string(),
                    recorded: format_payload_preview(&entry.input),
                    current: format_payload_preview(current),
                },
            });
        }

        Ok(())
    }

    /// The activity run this attempt scheduled, if any.
    pub(crate) async fn scheduled_activity(&self) -> Option<SuspendReason> {
        let cursor = self.inner.cursor.lock().await;
        cursor
            .scheduled
            .as_ref()
            .map(|(activity, activity_run_id)| SuspendReason::ActivityScheduled {
                activity: activity.clone(),
                activity_run_id: activity_run_id.clone(),
            })
    }

    /// Ends the attempt and hands the transaction back to the worker.
    pub(crate) async fn take_transaction(&self) -> Option<Box<dyn RunTransaction>> {
        self.inner.cursor.lock().await.tx.take()
    }
}

impl fmt::Debug for ReplayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayContext")
            .field("workflow_run_id", &self.inner.workflow_run_id)
            .field("history_len", &self.inner.history.len())
            .finish_non_exhaustive()
    }
}

/// Context handed to an activity function.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    activity_run_id: String,
    workflow_run_id: String,
    activity_name: String,
    cancellation_token: CancellationToken,
}

impl ActivityContext {
    pub(crate) fn new(run: &ActivityRun, cancellation_token: CancellationToken) -> Self {
        Self {
            activity_run_id: run.id.clone(),
            workflow_run_id: run.workflow_run_id.clone(),
            activity_name: run.activity_name.clone(),
            cancellation_token,
        }
    }

    /// Creates a context that is never cancelled, for calling activity
    /// functions directly.
    pub fn detached(
        activity_run_id: impl Into<String>,
        workflow_run_id: impl Into<String>,
        activity_name: impl Into<String>,
    ) -> Self {
        Self {
            activity_run_id: activity_run_id.into(),
            workflow_run_id: workflow_run_id.into(),
            activity_name: activity_name.into(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn activity_run_id(&self) -> &str {
        &self.activity_run_id
    }

    pub fn workflow_run_id(&self) -> &str {
        &self.workflow_run_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Returns true once the worker running this activity is shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Completes when the worker running this activity starts shutting
    /// down. Long-running activities can `select!` on it.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}
