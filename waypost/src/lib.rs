//! Waypost: durable workflow orchestration backed by a relational store
//!
//! A workflow is an ordinary async function whose side effects run as
//! *activities*. Every activity call is recorded, so after a crash or a
//! restart the workflow is re-executed from the top and the recorded results
//! are replayed instead of running the side effects again. Workers on any
//! number of processes share the work through row-level claims with leases.
//!
//! # Quick Start
//!
//! ```no_run
//! use waypost::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::connect(EngineConfig::new(DbConfig::from_env()?, true)).await?;
//!
//!     let greet = engine.register_activity(
//!         "greet",
//!         |_ctx: ActivityContext, (name, age): (String, u32)| async move {
//!             Ok::<_, String>(format!("Hello {name}, you are {age}"))
//!         },
//!     )?;
//!     let welcome = engine.register_workflow(
//!         "welcome",
//!         move |ctx: ReplayContext, (name, age): (String, u32)| {
//!             let greet = greet.clone();
//!             async move { ctx.execute_activity(&greet, (name, age)).await }
//!         },
//!     )?;
//!
//!     let handle = engine.start().await;
//!     let run_id = engine.invoke_workflow(&welcome, ("test".to_string(), 42)).await?;
//!     println!("Invoked workflow run {run_id}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: run records, statuses and payload encoding
//! - [`storage`]: repositories and transactions over a run store
//! - [`executor`]: registry, replay context and workers
//! - [`config`]: connection and worker settings
//! - [`engine`]: the facade tying them together

pub mod config;
pub mod core;
pub mod engine;
pub mod executor;
pub mod storage;

pub use config::{ConfigError, DbConfig, EngineConfig, PoolConfig, WorkerConfig};

pub use core::{
    deserialize_value, serialize_value, ActivityRun, ActivityStatus, CoreError,
    Result as CoreResult, WorkflowDefinition, WorkflowRun, WorkflowStatus,
};

pub use engine::{Engine, EngineError, EngineHandle};

pub use executor::{
    ActivityContext, ActivityRef, ActivityWorker, FunctionKind, HistoryMismatch, Registry,
    RegistryError, ReplayContext, WorkerHandle, WorkflowError, WorkflowRef, WorkflowWorker,
};

pub use storage::{ClaimOrder, InMemoryRunStore, RunStore, StorageError};

#[cfg(feature = "postgres")]
pub use storage::PostgresRunStore;

// Re-export dependencies used in public API
pub use serde;
pub use serde_json;
pub use tokio;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use waypost::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{DbConfig, EngineConfig, PoolConfig, WorkerConfig};

    pub use crate::core::{WorkflowRun, WorkflowStatus};

    pub use crate::engine::{Engine, EngineError, EngineHandle};

    pub use crate::executor::{
        ActivityContext, ActivityRef, Registry, ReplayContext, WorkflowError, WorkflowRef,
    };

    pub use crate::storage::{InMemoryRunStore, RunStore};

    #[cfg(feature = "postgres")]
    pub use crate::storage::PostgresRunStore;

    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
}
