use super::{
    error::Result, error::StorageError, params::ClaimOrder, params::ClaimParams,
    params::LeaseParams, ActivityRunRepository, RunStore, RunTransaction, WorkflowRepository,
};
use crate::core::{
    ActivityRun, ActivityStatus, WorkflowDefinition, WorkflowRun, WorkflowStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    workflows: HashMap<String, WorkflowDefinition>,
    workflow_runs: HashMap<String, WorkflowRun>,
    /// Kept in insertion order, which is also history order.
    activity_runs: Vec<ActivityRun>,
}

/// In-memory run store.
///
/// Transactions are serialized: [`RunStore::begin`] waits until the
/// previous transaction has committed or rolled back, and each transaction
/// works on a private copy of the state that replaces the shared state on
/// commit. That makes every transaction trivially isolated and claims
/// trivially exclusive, at the cost of any concurrency between
/// transactions. Suitable for tests and single-process development only.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRunStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn begin(&self) -> Result<Box<dyn RunTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn reset(&self) -> Result<()> {
        *self.state.lock().await = MemoryState::default();
        Ok(())
    }
}

/// A transaction on an [`InMemoryRunStore`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

impl MemoryTransaction {
    fn workflow_run_mut(&mut self, id: &str) -> Result<&mut WorkflowRun> {
        self.staged
            .workflow_runs
            .get_mut(id)
            .ok_or_else(|| StorageError::WorkflowRunNotFound(id.to_string()))
    }

    fn activity_run_mut(&mut self, id: &str) -> Result<&mut ActivityRun> {
        self.staged
            .activity_runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StorageError::ActivityRunNotFound(id.to_string()))
    }

    fn set_workflow_status(run: &mut WorkflowRun, status: WorkflowStatus) {
        run.status = status;
        run.claimed_by = None;
        run.lease_expires_at = None;
        run.updated_at = Utc::now();
    }

    fn set_activity_status(run: &mut ActivityRun, status: ActivityStatus) {
        run.status = status;
        run.claimed_by = None;
        run.lease_expires_at = None;
        run.updated_at = Utc::now();
    }
}

#[async_trait]
impl RunTransaction for MemoryTransaction {
    fn workflows(&mut self) -> &mut dyn WorkflowRepository {
        self
    }

    fn activities(&mut self) -> &mut dyn ActivityRunRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for MemoryTransaction {
    async fn upsert_workflow(&mut self, workflow: &WorkflowDefinition) -> Result<()> {
        self.staged
            .workflows
            .entry(workflow.name.clone())
            .and_modify(|existing| existing.updated_at = Utc::now())
            .or_insert_with(|| workflow.clone());
        Ok(())
    }

    async fn get_workflow(&mut self, name: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.staged.workflows.get(name).cloned())
    }

    async fn create_workflow_run(&mut self, run: &WorkflowRun) -> Result<()> {
        if !self.staged.workflows.contains_key(&run.workflow_name) {
            return Err(StorageError::Constraint(format!(
                "workflow {} does not exist",
                run.workflow_name
            )));
        }
        if self.staged.workflow_runs.contains_key(&run.id) {
            return Err(StorageError::Constraint(format!(
                "workflow run {} already exists",
                run.id
            )));
        }

        self.staged.workflow_runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_workflow_run(&mut self, id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.staged.workflow_runs.get(id).cloned())
    }

    async fn get_next_workflow_run(&mut self, params: ClaimParams) -> Result<Option<WorkflowRun>> {
        let eligible = self.staged.workflow_runs.values().filter(|run| match run.status {
            WorkflowStatus::Pending => run.scheduled_at <= params.now,
            WorkflowStatus::Executing => run
                .lease_expires_at
                .is_some_and(|expires_at| expires_at < params.now),
            _ => false,
        });

        let key = |run: &&WorkflowRun| (run.scheduled_at, run.created_at, run.id.clone());
        let next = match params.order {
            ClaimOrder::OldestFirst => eligible.min_by_key(key),
            ClaimOrder::NewestFirst => eligible.max_by_key(key),
        };

        Ok(next.cloned())
    }

    async fn claim_workflow_run(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<()> {
        let run = self.workflow_run_mut(id)?;
        run.status = WorkflowStatus::Executing;
        run.claimed_by = Some(lease.worker_id.to_string());
        run.lease_expires_at = Some(lease.expires_at);
        run.updated_at = Utc::now();

        debug!("Claimed workflow run: id={}, worker={}", id, lease.worker_id);
        Ok(())
    }

    async fn renew_lease(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<bool> {
        match self.staged.workflow_runs.get_mut(id) {
            Some(run)
                if run.status == WorkflowStatus::Executing
                    && run.claimed_by.as_deref() == Some(lease.worker_id) =>
            {
                run.lease_expires_at = Some(lease.expires_at);
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn change_workflow_run_status(&mut self, id: &str, status: WorkflowStatus) -> Result<()> {
        let run = self.workflow_run_mut(id)?;
        Self::set_workflow_status(run, status);
        Ok(())
    }

    async fn release_workflow_run(&mut self, id: &str, retry_at: DateTime<Utc>) -> Result<()> {
        let run = self.workflow_run_mut(id)?;
        Self::set_workflow_status(run, WorkflowStatus::Pending);
        run.scheduled_at = retry_at;
        run.retry_count += 1;
        Ok(())
    }

    async fn finish_workflow_run(&mut self, id: &str, output: &Value) -> Result<()> {
        let run = self.workflow_run_mut(id)?;
        Self::set_workflow_status(run, WorkflowStatus::Finished);
        run.output = Some(output.clone());
        run.error_message = None;
        Ok(())
    }

    async fn mark_workflow_run_errored(
        &mut self,
        id: &str,
        status: WorkflowStatus,
        error_message: &str,
    ) -> Result<()> {
        let run = self.workflow_run_mut(id)?;
        Self::set_workflow_status(run, status);
        run.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn resume_workflow_run(&mut self, id: &str) -> Result<bool> {
        match self.staged.workflow_runs.get_mut(id) {
            Some(run) if run.status == WorkflowStatus::WaitingActivity => {
                Self::set_workflow_status(run, WorkflowStatus::Pending);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ActivityRunRepository for MemoryTransaction {
    async fn create_activity_run(&mut self, run: &ActivityRun) -> Result<()> {
        if !self.staged.workflow_runs.contains_key(&run.workflow_run_id) {
            return Err(StorageError::Constraint(format!(
                "workflow run {} does not exist",
                run.workflow_run_id
            )));
        }
        if self.staged.activity_runs.iter().any(|existing| existing.id == run.id) {
            return Err(StorageError::Constraint(format!(
                "activity run {} already exists",
                run.id
            )));
        }

        self.staged.activity_runs.push(run.clone());
        Ok(())
    }

    async fn get_activity_run(&mut self, id: &str) -> Result<Option<ActivityRun>> {
        Ok(self
            .staged
            .activity_runs
            .iter()
            .find(|run| run.id == id)
            .cloned())
    }

    async fn get_activity_run_history(
        &mut self,
        workflow_run_id: &str,
    ) -> Result<Vec<ActivityRun>> {
        Ok(self
            .staged
            .activity_runs
            .iter()
            .filter(|run| run.workflow_run_id == workflow_run_id)
            .cloned()
            .collect())
    }

    async fn get_next_activity_run(&mut self, params: ClaimParams) -> Result<Option<ActivityRun>> {
        let eligible = self.staged.activity_runs.iter().filter(|run| match run.status {
            ActivityStatus::Pending => run.scheduled_at <= params.now,
            ActivityStatus::Executing => run
                .lease_expires_at
                .is_some_and(|expires_at| expires_at < params.now),
            _ => false,
        });

        // min_by_key keeps the first of equal keys, max_by_key the last.
        let next = match params.order {
            ClaimOrder::OldestFirst => eligible.min_by_key(|run| run.scheduled_at),
            ClaimOrder::NewestFirst => eligible.max_by_key(|run| run.scheduled_at),
        };

        Ok(next.cloned())
    }

    async fn claim_activity_run(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<()> {
        let run = self.activity_run_mut(id)?;
        run.status = ActivityStatus::Executing;
        run.claimed_by = Some(lease.worker_id.to_string());
        run.lease_expires_at = Some(lease.expires_at);
        run.updated_at = Utc::now();

        debug!("Claimed activity run: id={}, worker={}", id, lease.worker_id);
        Ok(())
    }

    async fn renew_activity_lease(&mut self, id: &str, lease: LeaseParams<'_>) -> Result<bool> {
        match self.staged.activity_runs.iter_mut().find(|run| run.id == id) {
            Some(run)
                if run.status == ActivityStatus::Executing
                    && run.claimed_by.as_deref() == Some(lease.worker_id) =>
            {
                run.lease_expires_at = Some(lease.expires_at);
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn change_activity_run_status(&mut self, id: &str, status: ActivityStatus) -> Result<()> {
        let run = self.activity_run_mut(id)?;
        Self::set_activity_status(run, status);
        Ok(())
    }

    async fn finish_activity_run(&mut self, id: &str, output: &Value) -> Result<()> {
        let run = self.activity_run_mut(id)?;
        Self::set_activity_status(run, ActivityStatus::Finished);
        run.output = Some(output.clone());
        Ok(())
    }

    async fn fail_activity_run(&mut self, id: &str, error_message: &str) -> Result<()> {
        let run = self.activity_run_mut(id)?;
        Self::set_activity_status(run, ActivityStatus::Failed);
        run.error_message = Some(error_message.to_string());
        Ok(())
    }
}
