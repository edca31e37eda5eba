use super::error::{CoreError, Result};
use super::id::generate_readable_id;
use super::serialization::deserialize_value;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a [`WorkflowRun`].
///
/// ```text
/// pending -> executing -> finished
///               |    \--> failed | aborted
///               v
///        waiting_activity -> pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Executing,
    WaitingActivity,
    Finished,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::WaitingActivity => "waiting_activity",
            WorkflowStatus::Finished => "finished",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
        }
    }

    /// Returns true once a run can never be claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Finished | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "executing" => Ok(WorkflowStatus::Executing),
            "waiting_activity" => Ok(WorkflowStatus::WaitingActivity),
            "finished" => Ok(WorkflowStatus::Finished),
            "failed" => Ok(WorkflowStatus::Failed),
            "aborted" => Ok(WorkflowStatus::Aborted),
            _ => Err(CoreError::InvalidStatus {
                kind: "workflow",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle state of an [`ActivityRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Pending,
    Executing,
    Finished,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Executing => "executing",
            ActivityStatus::Finished => "finished",
            ActivityStatus::Failed => "failed",
        }
    }

    /// Returns true once the activity has produced an output or an error.
    pub fn is_settled(&self) -> bool {
        matches!(self, ActivityStatus::Finished | ActivityStatus::Failed)
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActivityStatus::Pending),
            "executing" => Ok(ActivityStatus::Executing),
            "finished" => Ok(ActivityStatus::Finished),
            "failed" => Ok(ActivityStatus::Failed),
            _ => Err(CoreError::InvalidStatus {
                kind: "activity",
                value: s.to_string(),
            }),
        }
    }
}

/// A named workflow type known to the run store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One invocation of a workflow with its JSON-encoded argument list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub input: Value,
    pub status: WorkflowStatus,
    /// Return value of a finished run.
    pub output: Option<Value>,
    /// Rendered error of a failed or aborted run.
    pub error_message: Option<String>,
    /// Worker currently holding the claim, if any.
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// How often a transient fault sent the run back to `pending`.
    pub retry_count: i32,
    /// Earliest time the run may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Creates a pending run with a freshly generated readable ID.
    pub fn pending(workflow_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: generate_readable_id(),
            workflow_name: workflow_name.into(),
            input,
            status: WorkflowStatus::Pending,
            output: None,
            error_message: None,
            claimed_by: None,
            lease_expires_at: None,
            retry_count: 0,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Decodes the output of a finished run.
    ///
    /// Returns `Ok(None)` while the run has no output.
    pub fn output_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.output.clone().map(deserialize_value).transpose()
    }
}

/// One scheduled activity call belonging to a workflow run.
///
/// The ordered list of these rows for a run is its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRun {
    pub id: String,
    pub workflow_run_id: String,
    pub activity_name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub status: ActivityStatus,
    /// Reserved retry bookkeeping, e.g. `{"retry_count": 0}`.
    pub retry_status: Option<Value>,
    /// Activity worker currently executing the run, if any.
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityRun {
    /// Creates a pending activity run with a freshly generated readable ID.
    pub fn pending(
        workflow_run_id: impl Into<String>,
        activity_name: impl Into<String>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_readable_id(),
            workflow_run_id: workflow_run_id.into(),
            activity_name: activity_name.into(),
            input,
            output: None,
            error_message: None,
            status: ActivityStatus::Pending,
            retry_status: None,
            claimed_by: None,
            lease_expires_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}
