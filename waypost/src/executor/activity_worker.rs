//! Activity worker.
//!
//! Claims pending activity runs under a lease, executes the registered
//! activity function outside of any transaction, and records the result.
//! Recording a result moves the owning workflow run from `waiting_activity`
//! back to `pending` so a workflow worker replays it with the new history
//! entry.
//!
//! The lease is renewed by a heartbeat while the activity runs. If the
//! worker dies, the lease runs out and another worker executes the activity
//! again, so activities should be idempotent.

use super::context::ActivityContext;
use super::registry::Registry;
use super::worker::{deadline_after, spawn_heartbeat, LeaseKind, WorkerHandle};
use crate::config::{WorkerConfig, DEFAULT_LEASE_DURATION, DEFAULT_POLL_INTERVAL};
use crate::core::{ActivityRun, ActivityStatus};
use crate::storage::{ClaimOrder, ClaimParams, LeaseParams, RunStore, StorageError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one iteration of the activity worker loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityTickOutcome {
    /// No activity run was pending.
    Idle,
    Finished {
        activity_run_id: String,
        workflow_run_id: String,
    },
    Failed {
        activity_run_id: String,
        workflow_run_id: String,
        message: String,
    },
    /// Another worker took the activity run over after this worker's lease
    /// ran out; the result was discarded.
    LeaseLost { activity_run_id: String },
}

/// Polls the run store for pending activity runs and executes them.
pub struct ActivityWorker<S: RunStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    worker_id: String,
    poll_interval: Duration,
    lease_duration: Duration,
    claim_order: ClaimOrder,
    /// Cancelled on shutdown; activities observe it through their context.
    shutdown: CancellationToken,
}

impl<S: RunStore + 'static> ActivityWorker<S> {
    /// Creates a worker with a random ID and default timings.
    pub fn new(store: Arc<S>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            worker_id: format!("activity-worker-{}", Uuid::new_v4()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            claim_order: ClaimOrder::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Applies timings, claim order and (if set) identity from `config`.
    pub fn with_config(mut self, config: &WorkerConfig) -> Self {
        self.poll_interval = config.poll_interval;
        self.lease_duration = config.lease_duration;
        self.claim_order = config.claim_order;
        if let Some(worker_id) = &config.worker_id {
            self.worker_id = format!("{worker_id}-activities");
        }
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets how long the loop sleeps after finding no work.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long a claim stays valid without a heartbeat.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.claim_order = order;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one iteration: claim at most one activity run, execute it and
    /// record the result.
    pub async fn tick(&self) -> Result<ActivityTickOutcome, StorageError> {
        let Some(activity) = self.pick_next_activity().await? else {
            return Ok(ActivityTickOutcome::Idle);
        };

        let result = {
            let _heartbeat = spawn_heartbeat(
                self.store.clone(),
                LeaseKind::Activity,
                &activity.id,
                &self.worker_id,
                self.lease_duration,
            );
            self.execute_activity(&activity).await
        };
        self.record_result(activity, result).await
    }

    async fn pick_next_activity(&self) -> Result<Option<ActivityRun>, StorageError> {
        let mut tx = self.store.begin().await?;
        let next = tx
            .activities()
            .get_next_activity_run(ClaimParams::new(self.claim_order))
            .await?;

        let Some(mut activity) = next else {
            tx.rollback().await?;
            return Ok(None);
        };

        let lease = self.lease();
        tx.activities().claim_activity_run(&activity.id, lease).await?;
        tx.commit().await?;

        if activity.status == ActivityStatus::Executing {
            warn!(
                "Worker {} reclaimed activity run {} after lease of {:?} expired",
                self.worker_id, activity.id, activity.claimed_by
            );
        }
        debug!(
            "Worker {} claimed activity run: id={}, activity={}",
            self.worker_id, activity.id, activity.activity_name
        );
        activity.status = ActivityStatus::Executing;
        activity.claimed_by = Some(self.worker_id.clone());
        activity.lease_expires_at = Some(lease.expires_at);
        Ok(Some(activity))
    }

    fn lease(&self) -> LeaseParams<'_> {
        LeaseParams {
            worker_id: &self.worker_id,
            expires_at: deadline_after(self.lease_duration),
        }
    }

    /// Runs the activity on its own task so a panic is contained.
    async fn execute_activity(&self, activity: &ActivityRun) -> Result<Value, String> {
        let Some(call) = self.registry.activity(&activity.activity_name) else {
            return Err(format!(
                "activity {} is not registered",
                activity.activity_name
            ));
        };

        let ctx = ActivityContext::new(activity, self.shutdown.child_token());
        match tokio::spawn(call(ctx, activity.input.clone())).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_error) if join_error.is_panic() => Err("activity panicked".to_string()),
            Err(join_error) => Err(format!("activity task failed: {join_error}")),
        }
    }

    async fn record_result(
        &self,
        activity: ActivityRun,
        result: Result<Value, String>,
    ) -> Result<ActivityTickOutcome, StorageError> {
        let workflow_run_id = activity.workflow_run_id.clone();
        let mut tx = self.store.begin().await?;

        // Re-asserting the lease also locks the row until commit.
        if !tx.activities().renew_activity_lease(&activity.id, self.lease()).await? {
            tx.rollback().await?;
            warn!(
                "Worker {} lost the lease on activity run {}; discarding result",
                self.worker_id, activity.id
            );
            return Ok(ActivityTickOutcome::LeaseLost {
                activity_run_id: activity.id,
            });
        }

        let outcome = match result {
            Ok(output) => {
                tx.activities()
                    .finish_activity_run(&activity.id, &output)
                    .await?;
                ActivityTickOutcome::Finished {
                    activity_run_id: activity.id,
                    workflow_run_id: activity.workflow_run_id,
                }
            }
            Err(message) => {
                tx.activities()
                    .fail_activity_run(&activity.id, &message)
                    .await?;
                ActivityTickOutcome::Failed {
                    activity_run_id: activity.id,
                    workflow_run_id: activity.workflow_run_id,
                    message,
                }
            }
        };

        let resumed = tx.workflows().resume_workflow_run(&workflow_run_id).await?;
        tx.commit().await?;

        match &outcome {
            ActivityTickOutcome::Finished { activity_run_id, .. } => info!(
                "Worker {} finished activity run: id={}, activity={}",
                self.worker_id, activity_run_id, activity.activity_name
            ),
            ActivityTickOutcome::Failed {
                activity_run_id,
                message,
                ..
            } => warn!(
                "Worker {} activity run failed: id={}, activity={}, error={}",
                self.worker_id, activity_run_id, activity.activity_name, message
            ),
            ActivityTickOutcome::Idle | ActivityTickOutcome::LeaseLost { .. } => {}
        }
        if !resumed {
            debug!(
                "Workflow run {} was not waiting; left as is",
                workflow_run_id
            );
        }

        Ok(outcome)
    }

    /// Starts the worker in the background.
    ///
    /// Seals the registry first. Shutting the returned handle down also
    /// cancels the [`ActivityContext`] of the activity in progress.
    pub async fn start(self) -> WorkerHandle {
        self.registry.seal();

        let cancellation_token = self.shutdown.clone();
        let worker_token = cancellation_token.clone();
        let worker_id = self.worker_id.clone();

        info!("Starting activity worker: {}", self.worker_id);

        let handle = tokio::spawn(async move {
            while !worker_token.is_cancelled() {
                let idle = match self.tick().await {
                    Ok(ActivityTickOutcome::Idle) => true,
                    Ok(_) => false,
                    Err(e) => {
                        error!("Worker {} iteration failed: {}", self.worker_id, e);
                        true
                    }
                };

                if idle {
                    tokio::select! {
                        biased;
                        _ = worker_token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }

            info!("Worker {} stopped", self.worker_id);
        });

        WorkerHandle::new(worker_id, handle, cancellation_token)
    }
}
