//! Process-wide function registry.
//!
//! Workflows and activities are registered under explicit string names. The
//! name is what gets persisted (`workflow_runs.workflow_name`,
//! `activity_runs.activity_name`), so it must stay stable across deploys;
//! the Rust function behind it may change freely as long as its history
//! stays compatible.
//!
//! Registration returns a typed handle ([`WorkflowRef`] / [`ActivityRef`])
//! that carries the input and output types, so invoking a workflow or
//! executing an activity with the wrong argument types does not compile.
//! Internally each function is stored type-erased as a closure over JSON
//! values.

use super::context::{ActivityContext, ReplayContext};
use super::error::{BoxError, FunctionKind, RegistryError, WorkflowError};
use crate::core::serialize_value;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Longest accepted function name.
const MAX_NAME_LENGTH: usize = 255;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased workflow function.
pub(crate) type WorkflowFn = Arc<
    dyn Fn(ReplayContext, Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync,
>;

/// Type-erased activity function.
pub(crate) type ActivityFn =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Checks that a JSON argument list fits the registered input type.
type InputValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct Registered<F> {
    call: F,
    validate_input: InputValidator,
}

/// Typed handle to a registered workflow.
pub struct WorkflowRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> WorkflowRef<I, O> {
    /// Creates a handle by name without registering anything.
    ///
    /// [`Engine::invoke_workflow`](crate::Engine::invoke_workflow) still
    /// requires the workflow to be registered on that engine, since it
    /// checks the arguments against the registered input type before any
    /// run is written. A process that invokes workflows must therefore
    /// register them too, even if only other processes execute them.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<I, O> Clone for WorkflowRef<I, O> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<I, O> fmt::Debug for WorkflowRef<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkflowRef").field(&self.name).finish()
    }
}

/// Typed handle to a registered activity.
pub struct ActivityRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> ActivityRef<I, O> {
    /// Creates a handle by name without registering anything.
    ///
    /// Workflows may schedule activities that only a separate activity
    /// worker process has registered.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<I, O> Clone for ActivityRef<I, O> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<I, O> fmt::Debug for ActivityRef<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActivityRef").field(&self.name).finish()
    }
}

/// Registry of workflow and activity functions.
///
/// Registration is open until [`Registry::seal`] is called; workers seal the
/// registry they run against when they start. Lookups are lock-free.
///
/// # Example
///
/// ```
/// use waypost::executor::{ActivityContext, Registry, ReplayContext, WorkflowError};
///
/// let registry = Registry::new();
/// let add = registry
///     .register_activity("add", |_ctx: ActivityContext, (a, b): (i64, i64)| async move {
///         Ok::<_, String>(a + b)
///     })
///     .unwrap();
///
/// registry
///     .register_workflow("sum", move |ctx: ReplayContext, (a, b): (i64, i64)| {
///         let add = add.clone();
///         async move { ctx.execute_activity(&add, (a, b)).await }
///     })
///     .unwrap();
///
/// assert!(registry.contains(waypost::executor::FunctionKind::Workflow, "sum"));
/// ```
pub struct Registry {
    workflows: DashMap<String, Registered<WorkflowFn>>,
    activities: DashMap<String, Registered<ActivityFn>>,
    sealed: RwLock<bool>,
}

impl Registry {
    /// Creates a new, open registry.
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
            activities: DashMap::new(),
            sealed: RwLock::new(false),
        }
    }

    /// Registers a workflow function under `name`.
    ///
    /// The function receives the run's [`ReplayContext`] and its decoded
    /// argument list. Multiple arguments are passed as a tuple, which is
    /// stored as a JSON array.
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
        let name = name.into();
        validate_name(FunctionKind::Workflow, &name)?;

        let call: WorkflowFn = Arc::new(
            move |ctx: ReplayContext,
                  input: Value|
                  -> BoxFuture<'static, Result<Value, WorkflowError>> {
                match serde_json::from_value::<I>(input) {
                    Ok(input) => {
                        let invocation = workflow(ctx, input);
                        Box::pin(async move {
                            let output = invocation.await?;
                            Ok(serialize_value(&output)?)
                        })
                    }
                    Err(e) => Box::pin(async move { Err(WorkflowError::InvalidInput(e.to_string())) }),
                }
            },
        );

        let entry = Registered {
            call,
            validate_input: input_validator::<I>(),
        };
        self.insert(&self.workflows, FunctionKind::Workflow, &name, entry)?;

        debug!("Registered workflow: {}", name);
        Ok(WorkflowRef::new(name))
    }

    /// Registers an activity function under `name`.
    ///
    /// Activities run outside of replay, exactly once per activity run, so
    /// they are the place for side effects. The returned error is recorded
    /// on the activity run and surfaced to the workflow on replay.
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
        let name = name.into();
        validate_name(FunctionKind::Activity, &name)?;

        let call: ActivityFn = Arc::new(
            move |ctx: ActivityContext, input: Value| -> BoxFuture<'static, Result<Value, BoxError>> {
                match serde_json::from_value::<I>(input) {
                    Ok(input) => {
                        let invocation = activity(ctx, input);
                        Box::pin(async move {
                            let output = invocation.await.map_err(Into::<BoxError>::into)?;
                            Ok(serde_json::to_value(&output)?)
                        })
                    }
                    Err(e) => Box::pin(async move { Err(BoxError::from(e)) }),
                }
            },
        );

        let entry = Registered {
            call,
            validate_input: input_validator::<I>(),
        };
        self.insert(&self.activities, FunctionKind::Activity, &name, entry)?;

        debug!("Registered activity: {}", name);
        Ok(ActivityRef::new(name))
    }

    fn insert<F>(
        &self,
        map: &DashMap<String, Registered<F>>,
        kind: FunctionKind,
        name: &str,
        entry: Registered<F>,
    ) -> Result<(), RegistryError> {
        // Held across the insert so seal() cannot interleave with it.
        let sealed = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        if *sealed {
            return Err(RegistryError::Sealed {
                kind,
                name: name.to_string(),
            });
        }

        match map.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered {
                kind,
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Closes registration. Every later register call fails with
    /// [`RegistryError::Sealed`].
    pub fn seal(&self) {
        let mut sealed = self.sealed.write().unwrap_or_else(PoisonError::into_inner);
        if !*sealed {
            *sealed = true;
            debug!(
                "Registry sealed: {} workflows, {} activities",
                self.workflows.len(),
                self.activities.len()
            );
        }
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if a function of `kind` is registered under `name`.
    pub fn contains(&self, kind: FunctionKind, name: &str) -> bool {
        match kind {
            FunctionKind::Workflow => self.workflows.contains_key(name),
            FunctionKind::Activity => self.activities.contains_key(name),
        }
    }

    /// Checks that `args` would decode into the input type registered for
    /// `name`.
    pub fn validate_args(
        &self,
        kind: FunctionKind,
        name: &str,
        args: &Value,
    ) -> Result<(), RegistryError> {
        let validator = match kind {
            FunctionKind::Workflow => self
                .workflows
                .get(name)
                .map(|entry| entry.validate_input.clone()),
            FunctionKind::Activity => self
                .activities
                .get(name)
                .map(|entry| entry.validate_input.clone()),
        };
        let validator = validator.ok_or_else(|| RegistryError::NotRegistered {
            kind,
            name: name.to_string(),
        })?;

        validator(args).map_err(|reason| RegistryError::InvalidArguments {
            kind,
            name: name.to_string(),
            reason,
        })
    }

    /// Names of all registered functions of `kind`, sorted.
    pub fn names(&self, kind: FunctionKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            FunctionKind::Workflow => self.workflows.iter().map(|e| e.key().clone()).collect(),
            FunctionKind::Activity => self.activities.iter().map(|e| e.key().clone()).collect(),
        };
        names.sort();
        names
    }

    pub(crate) fn workflow(&self, name: &str) -> Option<WorkflowFn> {
        self.workflows.get(name).map(|entry| entry.call.clone())
    }

    pub(crate) fn activity(&self, name: &str) -> Option<ActivityFn> {
        self.activities.get(name).map(|entry| entry.call.clone())
    }

    /// Returns the number of registered functions of both kinds.
    pub fn len(&self) -> usize {
        self.workflows.len() + self.activities.len()
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn input_validator<I: DeserializeOwned + 'static>() -> InputValidator {
    Arc::new(|args: &Value| {
        serde_json::from_value::<I>(args.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

fn validate_name(kind: FunctionKind, name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name.trim() == name
        && !name.chars().any(char::is_control);

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}
