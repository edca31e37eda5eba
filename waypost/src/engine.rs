//! Engine facade.
//!
//! [`Engine`] ties a run store and a registry together: it is where
//! functions are registered, workflows are invoked, runs are inspected and
//! workers are started.

use crate::config::WorkerConfig;
use crate::core::{
    serialize_value, ActivityRun, CoreError, WorkflowDefinition, WorkflowRun,
};
use crate::executor::{
    ActivityContext, ActivityRef, ActivityWorker, BoxError, FunctionKind, Registry, RegistryError,
    ReplayContext, WorkerHandle, WorkflowError, WorkflowRef, WorkflowWorker,
};
use crate::storage::{RunStore, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[cfg(feature = "postgres")]
use crate::{config::EngineConfig, storage::PostgresRunStore};

/// Errors returned by the [`Engine`] facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Registration or argument validation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Entry point of the workflow engine.
///
/// # Example
///
/// ```no_run
/// use waypost::prelude::*;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Engine::connect(EngineConfig::new(DbConfig::from_env()?, true)).await?;
///
/// let add = engine.register_activity("add", |_ctx: ActivityContext, (a, b): (i64, i64)| async move {
///     Ok::<_, String>(a + b)
/// })?;
/// let sum = engine.register_workflow("sum", move |ctx: ReplayContext, (a, b): (i64, i64)| {
///     let add = add.clone();
///     async move { ctx.execute_activity(&add, (a, b)).await }
/// })?;
///
/// let handle = engine.start().await;
/// let run_id = engine.invoke_workflow(&sum, (40, 2)).await?;
/// println!("invoked {run_id}");
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Engine<S: RunStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    worker_config: WorkerConfig,
}

#[cfg(feature = "postgres")]
impl Engine<PostgresRunStore> {
    /// Connects to Postgres and, if `config.init_db` is set, creates any
    /// missing tables.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let store = PostgresRunStore::connect(&config.db, &config.pool).await?;
        if config.init_db {
            store.initialize().await?;
        }

        info!(
            "Engine connected: host={}, database={}, init_db={}",
            config.db.host, config.db.database, config.init_db
        );
        Ok(Self::with_store(Arc::new(store)).with_worker_config(config.worker))
    }
}

impl<S: RunStore + 'static> Engine<S> {
    /// Creates an engine over an existing store with an empty registry.
    pub fn with_store(store: Arc<S>) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::new()),
            worker_config: WorkerConfig::default(),
        }
    }

    /// Sets the configuration used for workers built by this engine.
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers a workflow. See [`Registry::register_workflow`].
    pub fn register_workflow<I, O, F, Fut>(
        &self,
        name: impl Into<String>,
        workflow: F,
    ) -> Result<WorkflowRef<I, O>, RegistryError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ReplayContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    {
        self.registry.register_workflow(name, workflow)
    }

    /// Registers an activity. See [`Registry::register_activity`].
    pub fn register_activity<I, O, E, F, Fut>(
        &self,
        name: impl Into<String>,
        activity: F,
    ) -> Result<ActivityRef<I, O>, RegistryError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        self.registry.register_activity(name, activity)
    }

    /// Creates a pending run of `workflow` and returns its ID.
    pub async fn invoke_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        input: I,
    ) -> Result<String, EngineError>
    where
        I: Serialize,
    {
        let args = serialize_value(&input)?;
        self.invoke_workflow_by_name(workflow.name(), args).await
    }

    /// Creates a pending run of the workflow registered as `name`.
    ///
    /// `args` must decode into the workflow's input type; multiple
    /// arguments are given as a JSON array. Nothing is written if the name
    /// is unknown or the arguments do not fit.
    pub async fn invoke_workflow_by_name(
        &self,
        name: &str,
        args: Value,
    ) -> Result<String, EngineError> {
        self.registry
            .validate_args(FunctionKind::Workflow, name, &args)?;

        let run = WorkflowRun::pending(name, args);
        let mut tx = self.store.begin().await?;
        tx.workflows()
            .upsert_workflow(&WorkflowDefinition::new(name))
            .await?;
        tx.workflows().create_workflow_run(&run).await?;
        tx.commit().await?;

        info!("Invoked workflow: name={}, run_id={}", name, run.id);
        Ok(run.id)
    }

    /// Looks a workflow run up by ID.
    pub async fn get_workflow_run(&self, id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let mut tx = self.store.begin().await?;
        let run = tx.workflows().get_workflow_run(id).await?;
        tx.commit().await?;
        Ok(run)
    }

    /// Returns the recorded activity runs of a workflow run, oldest first.
    pub async fn get_activity_history(
        &self,
        workflow_run_id: &str,
    ) -> Result<Vec<ActivityRun>, EngineError> {
        let mut tx = self.store.begin().await?;
        let history = tx
            .activities()
            .get_activity_run_history(workflow_run_id)
            .await?;
        tx.commit().await?;
        Ok(history)
    }

    /// Builds a workflow worker over this engine's store and registry.
    pub fn workflow_worker(&self) -> WorkflowWorker<S> {
        WorkflowWorker::new(self.store.clone(), self.registry.clone())
            .with_config(&self.worker_config)
    }

    /// Builds an activity worker over this engine's store and registry.
    pub fn activity_worker(&self) -> ActivityWorker<S> {
        ActivityWorker::new(self.store.clone(), self.registry.clone())
            .with_config(&self.worker_config)
    }

    /// Starts one workflow worker and one activity worker.
    ///
    /// The registry is sealed from here on.
    pub async fn start(&self) -> EngineHandle {
        EngineHandle {
            workflows: self.workflow_worker().start().await,
            activities: self.activity_worker().start().await,
        }
    }

    /// Releases the store's connections.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.store.close().await?;
        Ok(())
    }
}

/// Handles of the workers started by [`Engine::start`].
pub struct EngineHandle {
    workflows: WorkerHandle,
    activities: WorkerHandle,
}

impl EngineHandle {
    pub fn workflow_worker(&self) -> &WorkerHandle {
        &self.workflows
    }

    pub fn activity_worker(&self) -> &WorkerHandle {
        &self.activities
    }

    /// Returns true while both workers are running.
    pub fn is_running(&self) -> bool {
        self.workflows.is_running() && self.activities.is_running()
    }

    /// Shuts both workers down and waits for them.
    pub async fn shutdown(self) {
        self.workflows.cancellation_token().cancel();
        self.activities.cancellation_token().cancel();
        self.workflows.shutdown().await;
        self.activities.shutdown().await;
    }
}
