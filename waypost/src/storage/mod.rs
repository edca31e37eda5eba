//! Storage layer for the waypost workflow engine.
//!
//! Everything the engine persists goes through a [`RunTransaction`] opened
//! on a [`RunStore`]. A transaction exposes two repositories:
//!
//! - [`WorkflowRepository`]: workflow definitions and workflow runs
//! - [`ActivityRunRepository`]: activity runs, i.e. run histories
//!
//! Backends:
//!
//! - [`PostgresRunStore`]: Postgres via sqlx with row-level locking claims
//! - [`InMemoryRunStore`]: In-process storage for tests and development
//!
//! # Example
//!
//! ```no_run
//! use waypost::storage::{InMemoryRunStore, RunStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryRunStore::new();
//! let mut tx = store.begin().await?;
//! let run = tx.workflows().get_workflow_run("brave-otter-x7Kq02Lm").await?;
//! assert!(run.is_none());
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::{
    ActivityRun, ActivityStatus, WorkflowDefinition, WorkflowRun, WorkflowStatus,
};

mod error;
mod params;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export public types
pub use error::{Result, StorageError};
pub use memory::InMemoryRunStore;
pub use params::{ClaimOrder, ClaimParams, LeaseParams};

#[cfg(feature = "postgres")]
pub use postgres::PostgresRunStore;

/// A transactional run store.
///
/// Implementations must be thread-safe. Every read and write happens inside
/// a [`RunTransaction`]; nothing is visible to other transactions until
/// [`RunTransaction::commit`] returns.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Opens a new transaction.
    async fn begin(&self) -> Result<Box<dyn RunTransaction>>;

    /// Creates the schema if it does not exist yet.
    ///
    /// Idempotent. Backends without a schema do nothing.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Removes every definition and run. Intended for tests.
    async fn reset(&self) -> Result<()>;

    /// Releases the underlying connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One open transaction on a [`RunStore`].
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait RunTransaction: Send {
    /// Workflow definition and workflow run operations.
    fn workflows(&mut self) -> &mut dyn WorkflowRepository;

    /// Activity run operations.
    fn activities(&mut self) -> &mut dyn ActivityRunRepository;

    /// Makes every write of this transaction durable and visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every write of this transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Operations on workflow definitions and workflow runs.
#[async_trait]
pub trait WorkflowRepository: Send {
    /// Inserts the definition, or touches `updated_at` if it already exists.
    async fn upsert_workflow(&mut self, workflow: &WorkflowDefinition) -> Result<()>;

    /// Looks a definition up by name.
    async fn get_workflow(&mut self, name: &str) -> Result<Option<WorkflowDefinition>>;

    /// Inserts a new run.
    ///
    /// Fails with [`StorageError::Constraint`] if the ID is taken or the
    /// workflow definition does not exist.
    async fn create_workflow_run(&mut self, run: &WorkflowRun) -> Result<()>;

    /// Looks a run up by ID.
    async fn get_workflow_run(&mut self, id: &str) -> Result<Option<WorkflowRun>>;

    /// Returns the next claimable run and locks it for this transaction.
    ///
    /// Rows locked by other transactions are skipped, so concurrent callers
    /// never receive the same run.
    async fn get_next_workflow_run(&mut self, params: ClaimParams) -> Result<Option<WorkflowRun>>;

    /// Moves a run to `executing` under the given worker's lease.
    async fn claim_workflow_run(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<()>;

    /// Extends the lease of a run still held by `lease.worker_id`.
    ///
    /// Returns false if the run is no longer executing under that worker.
    async fn renew_lease(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<bool>;

    /// Sets the status of a run and drops any lease.
    async fn change_workflow_run_status(&mut self, id: &str, status: WorkflowStatus) -> Result<()>;

    /// Puts a run back to `pending` after a transient fault.
    ///
    /// Drops the lease, increments `retry_count` and defers the run until
    /// `retry_at`.
    async fn release_workflow_run(&mut self, id: &str, retry_at: DateTime<Utc>) -> Result<()>;

    /// Marks a run `finished` and stores its output.
    async fn finish_workflow_run(&mut self, id: &str, output: &Value) -> Result<()>;

    /// Marks a run `failed` or `aborted` and stores the error message.
    async fn mark_workflow_run_errored(
        &mut self,
        id: &str,
        status: WorkflowStatus,
        error_message: &str,
    ) -> Result<()>;

    /// Moves a run from `waiting_activity` back to `pending`.
    ///
    /// Returns false if the run was in any other state.
    async fn resume_workflow_run(&mut self, id: &str) -> Result<bool>;
}

/// Operations on activity runs.
#[async_trait]
pub trait ActivityRunRepository: Send {
    /// Inserts a new activity run.
    ///
    /// Fails with [`StorageError::Constraint`] if the ID is taken or the
    /// owning workflow run does not exist.
    async fn create_activity_run(&mut self, run: &ActivityRun) -> Result<()>;

    /// Looks an activity run up by ID.
    async fn get_activity_run(&mut self, id: &str) -> Result<Option<ActivityRun>>;

    /// Returns the history of a workflow run: its activity runs in insertion
    /// order, oldest first.
    ///
    /// The order comes from the store itself, never from the timestamps
    /// written by workers, so hosts with skewed clocks agree on it.
    async fn get_activity_run_history(&mut self, workflow_run_id: &str)
        -> Result<Vec<ActivityRun>>;

    /// Returns the next claimable activity run and locks it for this
    /// transaction, skipping rows locked elsewhere.
    async fn get_next_activity_run(&mut self, params: ClaimParams) -> Result<Option<ActivityRun>>;

    /// Moves an activity run to `executing` under the given worker's lease.
    async fn claim_activity_run(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<()>;

    /// Extends the lease of an activity run still held by `lease.worker_id`.
    ///
    /// Returns false if the run is no longer executing under that worker.
    async fn renew_activity_lease(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<bool>;

    /// Sets the status of an activity run and drops any lease.
    async fn change_activity_run_status(&mut self, id: &str, status: ActivityStatus) -> Result<()>;

    /// Marks an activity run `finished`, stores its output and drops the lease.
    async fn finish_activity_run(&mut self, id: &str, output: &Value) -> Result<()>;

    /// Marks an activity run `failed`, stores the error message and drops
    /// the lease.
    async fn fail_activity_run(&mut self, id: &str, error_message: &str) -> Result<()>;
}
