//! Workflow worker.
//!
//! The worker loop repeatedly:
//!
//! 1. claims the next runnable workflow run (`pending`, or `executing`
//!    with an expired lease) and moves it to `executing` under its own
//!    lease, in one transaction;
//! 2. replays the run's workflow function against its history in a second
//!    transaction, renewing the lease from a heartbeat task meanwhile;
//! 3. maps the result onto the run's status:
//!
//! | workflow result                     | run status         |
//! |-------------------------------------|--------------------|
//! | `Ok(output)`                        | `finished`         |
//! | scheduling needed / in flight       | `waiting_activity` |
//! | transient storage fault             | back to `pending`  |
//! | mismatch, unknown workflow, bad input | `aborted`        |
//! | panic or any other error            | `failed`           |
//!
//! Finished and suspended outcomes commit together with the activity run
//! the attempt recorded. Errors roll the attempt back and record the new
//! status in a separate transaction.
//!
//! A run released after a transient fault is deferred by an exponential
//! backoff and failed once it has been released `max_retries` times.
//!
//! This implementation uses basic `info!`, `debug!`, `warn!`, and `error!`
//! logging; install a `tracing` subscriber to see it.

use super::context::ReplayContext;
use super::error::{Retryable, RunOutcome, SuspendReason, WorkflowError};
use super::registry::Registry;
use crate::config::{
    WorkerConfig, DEFAULT_LEASE_DURATION, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL,
    DEFAULT_RETRY_DELAY,
};
use crate::core::{WorkflowRun, WorkflowStatus};
use crate::storage::{ClaimOrder, ClaimParams, LeaseParams, RunStore, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shortest heartbeat period, whatever the lease.
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(10);

/// Cap on the backoff exponent for released runs.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// What one iteration of the workflow worker loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing was runnable.
    Idle,
    /// The run finished.
    Finished { run_id: String },
    /// The run is waiting on an activity.
    Suspended {
        run_id: String,
        reason: SuspendReason,
    },
    /// The run failed or was aborted.
    Errored {
        run_id: String,
        status: WorkflowStatus,
        message: String,
    },
    /// A transient fault interrupted the attempt; the run is pending again.
    Released { run_id: String, message: String },
    /// Another worker took the run over after this worker's lease ran out.
    LeaseLost { run_id: String },
}

/// Computes the instant `delay` from now, e.g. the expiry of a lease.
pub(crate) fn deadline_after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
    Utc::now() + delay
}

/// Delay before the next attempt of a run released `retry_count` times.
fn retry_backoff(base: Duration, retry_count: i32) -> Duration {
    let shift = u32::try_from(retry_count).unwrap_or(0).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1u32 << shift)
}

/// Which kind of run a lease is held on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseKind {
    Workflow,
    Activity,
}

/// Polls the run store for workflow runs and executes them.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use waypost::executor::{Registry, WorkflowWorker};
/// use waypost::storage::InMemoryRunStore;
///
/// # async fn example() {
/// let store = Arc::new(InMemoryRunStore::new());
/// let registry = Arc::new(Registry::new());
/// // ... register workflows ...
///
/// let handle = WorkflowWorker::new(store, registry)
///     .with_poll_interval(Duration::from_millis(100))
///     .start()
///     .await;
///
/// handle.shutdown().await;
/// # }
/// ```
pub struct WorkflowWorker<S: RunStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    worker_id: String,
    poll_interval: Duration,
    lease_duration: Duration,
    claim_order: ClaimOrder,
    retry_delay: Duration,
    max_retries: i32,
}

impl<S: RunStore + 'static> WorkflowWorker<S> {
    /// Creates a worker with a random ID and default timings.
    pub fn new(store: Arc<S>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            worker_id: format!("workflow-worker-{}", Uuid::new_v4()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            claim_order: ClaimOrder::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Applies timings, retry policy, claim order and (if set) identity
    /// from `config`.
    pub fn with_config(mut self, config: &WorkerConfig) -> Self {
        self.poll_interval = config.poll_interval;
        self.lease_duration = config.lease_duration;
        self.claim_order = config.claim_order;
        self.retry_delay = config.retry_delay;
        self.max_retries = config.max_retries;
        if let Some(worker_id) = &config.worker_id {
            self.worker_id = format!("{worker_id}-workflows");
        }
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Sets how long the loop sleeps after finding no work.
    ///
    /// Default: 1 second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long a claim stays valid without a heartbeat.
    ///
    /// The heartbeat renews it every third of this duration. Default: 30
    /// seconds.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_claim_order(mut self, order: ClaimOrder) -> Self {
        self.claim_order = order;
        self
    }

    /// Sets the base delay before a run released after a transient fault
    /// is retried. The delay doubles with every further release.
    ///
    /// Default: 1 second.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets how many times a run may be released before it is failed.
    ///
    /// Default: 5.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one iteration: claim at most one run and execute it.
    ///
    /// Storage errors raised while claiming or while recording a failure
    /// are returned; the loop logs them and retries after the poll
    /// interval.
    pub async fn tick(&self) -> Result<TickOutcome, StorageError> {
        let Some(run) = self.pick_next_workflow().await? else {
            return Ok(TickOutcome::Idle);
        };

        let outcome = match self.execute_workflow(&run).await {
            Ok(RunOutcome::Finished(_)) => {
                info!(
                    "Worker {} finished workflow run: id={}, workflow={}",
                    self.worker_id, run.id, run.workflow_name
                );
                TickOutcome::Finished { run_id: run.id }
            }
            Ok(RunOutcome::Suspended(reason)) => {
                info!(
                    "Worker {} suspended workflow run: id={}, reason={:?}",
                    self.worker_id, run.id, reason
                );
                TickOutcome::Suspended {
                    run_id: run.id,
                    reason,
                }
            }
            Ok(RunOutcome::LeaseLost) => {
                warn!(
                    "Worker {} lost the lease on workflow run {}; discarding attempt",
                    self.worker_id, run.id
                );
                TickOutcome::LeaseLost { run_id: run.id }
            }
            Err(error) => self.handle_workflow_error(run, error).await?,
        };

        Ok(outcome)
    }

    /// Claims the next runnable workflow run, in its own transaction.
    async fn pick_next_workflow(&self) -> Result<Option<WorkflowRun>, StorageError> {
        let mut tx = self.store.begin().await?;
        let next = tx
            .workflows()
            .get_next_workflow_run(ClaimParams::new(self.claim_order))
            .await?;

        let Some(mut run) = next else {
            tx.rollback().await?;
            return Ok(None);
        };

        let expires_at = deadline_after(self.lease_duration);
        let lease = LeaseParams {
            worker_id: &self.worker_id,
            expires_at,
        };
        tx.workflows().claim_workflow_run(&run.id, lease).await?;
        tx.commit().await?;

        if run.status == WorkflowStatus::Executing {
            warn!(
                "Worker {} reclaimed workflow run {} after lease of {:?} expired",
                self.worker_id, run.id, run.claimed_by
            );
        }
        debug!(
            "Worker {} claimed workflow run: id={}, workflow={}",
            self.worker_id, run.id, run.workflow_name
        );

        run.status = WorkflowStatus::Executing;
        run.claimed_by = Some(self.worker_id.clone());
        run.lease_expires_at = Some(expires_at);
        Ok(Some(run))
    }

    /// Replays the run's workflow against its history.
    async fn execute_workflow(&self, run: &WorkflowRun) -> Result<RunOutcome, WorkflowError> {
        let workflow = self
            .registry
            .workflow(&run.workflow_name)
            .ok_or_else(|| WorkflowError::NotRegistered(run.workflow_name.clone()))?;

        let mut tx = self.store.begin().await?;
        let history = tx.activities().get_activity_run_history(&run.id).await?;
        debug!(
            "Worker {} executing workflow run: id={}, history_len={}",
            self.worker_id,
            run.id,
            history.len()
        );

        let ctx = ReplayContext::new(run.id.clone(), history, tx);
        let result = {
            let _heartbeat = spawn_heartbeat(
                self.store.clone(),
                LeaseKind::Workflow,
                &run.id,
                &self.worker_id,
                self.lease_duration,
            );
            // On its own task so a panic is contained.
            match tokio::spawn(workflow(ctx.clone(), run.input.clone())).await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    Err(WorkflowError::failed("workflow panicked"))
                }
                Err(join_error) => Err(WorkflowError::failed(format!(
                    "workflow task failed: {join_error}"
                ))),
            }
        };

        let mut tx = ctx
            .take_transaction()
            .await
            .ok_or(WorkflowError::ContextClosed)?;

        let outcome = match (result, ctx.scheduled_activity().await) {
            // The activity run is in the transaction; the run must wait for it.
            (Ok(_), Some(reason)) => {
                warn!(
                    "Worker {} workflow run {} returned after scheduling an activity; suspending",
                    self.worker_id, run.id
                );
                RunOutcome::Suspended(reason)
            }
            (Ok(output), None) => RunOutcome::Finished(output),
            (Err(error), _) => match error.suspend_reason() {
                Some(reason) => RunOutcome::Suspended(reason),
                None => {
                    tx.rollback().await?;
                    return Err(error);
                }
            },
        };

        // Re-asserting the lease also locks the row until commit.
        if !tx.workflows().renew_lease(&run.id, self.lease()).await? {
            tx.rollback().await?;
            return Ok(RunOutcome::LeaseLost);
        }

        match &outcome {
            RunOutcome::Finished(output) => {
                tx.workflows().finish_workflow_run(&run.id, output).await?;
            }
            RunOutcome::Suspended(_) => {
                tx.workflows()
                    .change_workflow_run_status(&run.id, WorkflowStatus::WaitingActivity)
                    .await?;
            }
            RunOutcome::LeaseLost => {}
        }
        tx.commit().await?;

        Ok(outcome)
    }

    /// Records a failed attempt in a fresh transaction.
    async fn handle_workflow_error(
        &self,
        run: WorkflowRun,
        error: WorkflowError,
    ) -> Result<TickOutcome, StorageError> {
        let message = error.to_string();

        let mut tx = self.store.begin().await?;
        if !tx.workflows().renew_lease(&run.id, self.lease()).await? {
            tx.rollback().await?;
            warn!(
                "Worker {} lost the lease on workflow run {} before recording: {}",
                self.worker_id, run.id, message
            );
            return Ok(TickOutcome::LeaseLost { run_id: run.id });
        }

        if error.is_retryable() && run.retry_count < self.max_retries {
            let delay = retry_backoff(self.retry_delay, run.retry_count);
            let retry_at = deadline_after(delay);
            tx.workflows().release_workflow_run(&run.id, retry_at).await?;
            tx.commit().await?;

            warn!(
                "Worker {} released workflow run {} after transient error (retry {} in {:?}): {}",
                self.worker_id,
                run.id,
                run.retry_count + 1,
                delay,
                message
            );
            return Ok(TickOutcome::Released {
                run_id: run.id,
                message,
            });
        }

        let message = if error.is_retryable() {
            format!("{message} (gave up after {} retries)", run.retry_count)
        } else {
            message
        };
        let status = if error.is_fatal() {
            WorkflowStatus::Aborted
        } else {
            WorkflowStatus::Failed
        };
        tx.workflows()
            .mark_workflow_run_errored(&run.id, status, &message)
            .await?;
        tx.commit().await?;

        error!(
            "Worker {} workflow run {}: id={}, workflow={}, error={}",
            self.worker_id, status, run.id, run.workflow_name, message
        );
        Ok(TickOutcome::Errored {
            run_id: run.id,
            status,
            message,
        })
    }

    fn lease(&self) -> LeaseParams<'_> {
        LeaseParams {
            worker_id: &self.worker_id,
            expires_at: deadline_after(self.lease_duration),
        }
    }

    /// Starts the worker in the background.
    ///
    /// Seals the registry first. Returns a [`WorkerHandle`] that can be used
    /// to control the worker.
    pub async fn start(self) -> WorkerHandle {
        self.registry.seal();

        let cancellation_token = CancellationToken::new();
        let worker_token = cancellation_token.clone();
        let worker_id = self.worker_id.clone();

        info!("Starting workflow worker: {}", self.worker_id);

        let handle = tokio::spawn(async move {
            // A tick is never interrupted; shutdown is observed between ticks.
            while !worker_token.is_cancelled() {
                // A released run is deferred, but back off anyway in case
                // the fault is shared by every run.
                let idle = match self.tick().await {
                    Ok(TickOutcome::Idle | TickOutcome::Released { .. }) => true,
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

        WorkerHandle {
            worker_id,
            handle,
            cancellation_token,
        }
    }
}

/// Renews the lease on `run_id` every third of `lease` until the returned
/// guard is dropped or the lease turns out to be lost.
pub(crate) fn spawn_heartbeat<S: RunStore + 'static>(
    store: Arc<S>,
    kind: LeaseKind,
    run_id: &str,
    worker_id: &str,
    lease: Duration,
) -> DropGuard {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let run_id = run_id.to_string();
    let worker_id = worker_id.to_string();
    let period = (lease / 3).max(MIN_HEARTBEAT_PERIOD);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                renewed = renew_lease(&*store, kind, &run_id, &worker_id, lease) => match renewed {
                    Ok(true) => debug!("Worker {} renewed lease on {}", worker_id, run_id),
                    Ok(false) => {
                        warn!("Worker {} no longer holds {:?} run {}", worker_id, kind, run_id);
                        break;
                    }
                    Err(e) => warn!("Worker {} failed to renew lease on {}: {}", worker_id, run_id, e),
                }
            }
        }
    });

    guard
}

async fn renew_lease<S: RunStore>(
    store: &S,
    kind: LeaseKind,
    run_id: &str,
    worker_id: &str,
    lease: Duration,
) -> Result<bool, StorageError> {
    let mut tx = store.begin().await?;
    let params = LeaseParams {
        worker_id,
        expires_at: deadline_after(lease),
    };
    let renewed = match kind {
        LeaseKind::Workflow => tx.workflows().renew_lease(run_id, params).await?,
        LeaseKind::Activity => tx.activities().renew_activity_lease(run_id, params).await?,
    };
    tx.commit().await?;
    Ok(renewed)
}

/// Handle for controlling a running worker.
///
/// The `WorkerHandle` provides methods to check the worker's status and
/// request a graceful shutdown.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub(crate) fn new(
        worker_id: String,
        handle: JoinHandle<()>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            handle,
            cancellation_token,
        }
    }

    /// Returns the worker ID.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Child tokens created from it are cancelled when the worker shuts
    /// down.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Requests the worker to shut down gracefully.
    ///
    /// The worker finishes the iteration in progress, then stops.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await;
    }

    /// Returns true if the worker task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the worker immediately without waiting for completion.
    ///
    /// The run being executed keeps its lease until it expires and is then
    /// picked up by another worker. Prefer `shutdown()`.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkflowDefinition;
    use crate::executor::ActivityRef;
    use crate::storage::InMemoryRunStore;
    use serde_json::{json, Value};

    async fn enqueue(store: &InMemoryRunStore, workflow: &str) -> String {
        let mut tx = store.begin().await.unwrap();
        tx.workflows()
            .upsert_workflow(&WorkflowDefinition::new(workflow))
            .await
            .unwrap();
        let run = WorkflowRun::pending(workflow, json!(["test", 42]));
        tx.workflows().create_workflow_run(&run).await.unwrap();
        tx.commit().await.unwrap();
        run.id
    }

    async fn load(store: &InMemoryRunStore, id: &str) -> WorkflowRun {
        let mut tx = store.begin().await.unwrap();
        tx.workflows().get_workflow_run(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_idle_when_nothing_is_pending() {
        let store = Arc::new(InMemoryRunStore::new());
        let worker = WorkflowWorker::new(store, Arc::new(Registry::new()));

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_unregistered_workflow_is_aborted() {
        let store = Arc::new(InMemoryRunStore::new());
        let id = enqueue(&store, "ghost").await;
        let worker = WorkflowWorker::new(store.clone(), Arc::new(Registry::new()));

        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Errored { status: WorkflowStatus::Aborted, .. }
        ));

        let run = load(&store, &id).await;
        assert_eq!(run.status, WorkflowStatus::Aborted);
        assert_eq!(
            run.error_message.as_deref(),
            Some("workflow ghost is not registered")
        );
        assert!(run.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_user_error_fails_run() {
        let store = Arc::new(InMemoryRunStore::new());
        let id = enqueue(&store, "greet").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("greet", |_ctx: ReplayContext, _args: (String, i64)| async {
                Err::<String, _>(WorkflowError::failed("no greeting today"))
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry);
        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Errored { status: WorkflowStatus::Failed, .. }
        ));
        assert_eq!(load(&store, &id).await.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_stored_input_of_wrong_shape_aborts() {
        let store = Arc::new(InMemoryRunStore::new());
        let id = enqueue(&store, "count").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("count", |_ctx: ReplayContext, n: (u32,)| async move {
                Ok::<_, WorkflowError>(n.0)
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry);
        worker.tick().await.unwrap();
        assert_eq!(load(&store, &id).await.status, WorkflowStatus::Aborted);
    }

    #[tokio::test]
    async fn test_panicking_workflow_fails_run() {
        let store = Arc::new(InMemoryRunStore::new());
        let boom = enqueue(&store, "boom").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("boom", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                if true {
                    panic!("boom");
                }
                Ok::<(), WorkflowError>(())
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry);
        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Errored { status: WorkflowStatus::Failed, ref message, .. }
                if message.contains("workflow panicked")
        ));

        let run = load(&store, &boom).await;
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert!(run.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_permanent_storage_error_fails_run_without_blocking_others() {
        let store = Arc::new(InMemoryRunStore::new());
        let poison = enqueue(&store, "poison").await;
        let healthy = enqueue(&store, "healthy").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("poison", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Err::<(), _>(WorkflowError::from(StorageError::Constraint(
                    "duplicate key".into(),
                )))
            })
            .unwrap();
        registry
            .register_workflow("healthy", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Ok::<_, WorkflowError>("done")
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry);
        let first = worker.tick().await.unwrap();
        assert!(matches!(
            first,
            TickOutcome::Errored { status: WorkflowStatus::Failed, ref run_id, .. } if *run_id == poison
        ));
        let second = worker.tick().await.unwrap();
        assert_eq!(second, TickOutcome::Finished { run_id: healthy });
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_transient_error_defers_run() {
        let store = Arc::new(InMemoryRunStore::new());
        let flaky = enqueue(&store, "flaky").await;
        let healthy = enqueue(&store, "healthy").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("flaky", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Err::<(), _>(WorkflowError::from(StorageError::Connection("reset".into())))
            })
            .unwrap();
        registry
            .register_workflow("healthy", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Ok::<_, WorkflowError>("done")
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry)
            .with_retry_delay(Duration::from_secs(60));
        let first = worker.tick().await.unwrap();
        assert!(matches!(first, TickOutcome::Released { ref run_id, .. } if *run_id == flaky));

        // The released run is not due yet, so the next run goes first.
        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Finished { run_id: healthy }
        );
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);

        let run = load(&store, &flaky).await;
        assert_eq!(run.status, WorkflowStatus::Pending);
        assert_eq!(run.retry_count, 1);
        assert!(run.scheduled_at > Utc::now());
        assert!(run.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_transient_error_gives_up_after_max_retries() {
        let store = Arc::new(InMemoryRunStore::new());
        let flaky = enqueue(&store, "flaky").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("flaky", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Err::<(), _>(WorkflowError::from(StorageError::Connection("reset".into())))
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry)
            .with_retry_delay(Duration::ZERO)
            .with_max_retries(2);
        for _ in 0..2 {
            let outcome = worker.tick().await.unwrap();
            assert!(matches!(outcome, TickOutcome::Released { .. }));
        }
        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Errored { status: WorkflowStatus::Failed, ref message, .. }
                if message.contains("gave up after 2 retries")
        ));

        let run = load(&store, &flaky).await;
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.retry_count, 2);
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_backoff(base, 0), Duration::from_secs(1));
        assert_eq!(retry_backoff(base, 3), Duration::from_secs(8));
        assert_eq!(retry_backoff(base, 40), Duration::from_secs(64));
    }

    #[tokio::test]
    async fn test_swallowed_scheduling_still_suspends() {
        let store = Arc::new(InMemoryRunStore::new());
        let id = enqueue(&store, "stubborn").await;
        let registry = Arc::new(Registry::new());
        let add = ActivityRef::<(i64, i64), i64>::new("add");
        registry
            .register_workflow("stubborn", move |ctx: ReplayContext, _args: Vec<Value>| {
                let add = add.clone();
                async move {
                    let sum = ctx.execute_activity(&add, (1, 2)).await.unwrap_or(-1);
                    Ok::<_, WorkflowError>(sum)
                }
            })
            .unwrap();

        let worker = WorkflowWorker::new(store.clone(), registry);
        let outcome = worker.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Suspended {
                reason: SuspendReason::ActivityScheduled { ref activity, .. },
                ..
            } if activity == "add"
        ));

        let run = load(&store, &id).await;
        assert_eq!(run.status, WorkflowStatus::WaitingActivity);
        assert!(run.output.is_none());

        let mut tx = store.begin().await.unwrap();
        let history = tx.activities().get_activity_run_history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_workflow() {
        let store = Arc::new(InMemoryRunStore::new());
        let boom = enqueue(&store, "boom").await;
        let healthy = enqueue(&store, "healthy").await;
        let registry = Arc::new(Registry::new());
        registry
            .register_workflow("boom", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                if true {
                    panic!("boom");
                }
                Ok::<(), WorkflowError>(())
            })
            .unwrap();
        registry
            .register_workflow("healthy", |_ctx: ReplayContext, _args: Vec<Value>| async move {
                Ok::<_, WorkflowError>("done")
            })
            .unwrap();

        let handle = WorkflowWorker::new(store.clone(), registry)
            .with_poll_interval(Duration::from_millis(10))
            .start()
            .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while load(&store, &healthy).await.status != WorkflowStatus::Finished {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(load(&store, &boom).await.status, WorkflowStatus::Failed);
        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_start_and_shutdown() {
        let store = Arc::new(InMemoryRunStore::new());
        let registry = Arc::new(Registry::new());
        let worker = WorkflowWorker::new(store, registry.clone())
            .with_worker_id("test-worker")
            .with_poll_interval(Duration::from_millis(10));

        let handle = worker.start().await;
        assert_eq!(handle.worker_id(), "test-worker");
        assert!(handle.is_running());
        assert!(registry.is_sealed());

        handle.shutdown().await;
    }
}
