//! Execution engine.
//!
//! - [`Registry`]: name-keyed workflow and activity functions
//! - [`ReplayContext`]: per-attempt replay state; its
//!   [`execute_activity`](ReplayContext::execute_activity) is the core of
//!   deterministic replay
//! - [`WorkflowWorker`]: claims workflow runs and replays them
//! - [`ActivityWorker`]: claims activity runs and executes them
//!
//! # Writing workflows
//!
//! A workflow is an async function of a [`ReplayContext`] and its input
//! that returns `Result<O, WorkflowError>`. Every side effect goes through
//! an activity:
//!
//! ```
//! use waypost::executor::{ActivityRef, ReplayContext, WorkflowError};
//!
//! async fn checkout(ctx: ReplayContext, (order_id,): (String,)) -> Result<String, WorkflowError> {
//!     let reserve = ActivityRef::<(String,), u32>::new("reserve_stock");
//!     let charge = ActivityRef::<(String, u32), String>::new("charge_card");
//!
//!     let items = ctx.execute_activity(&reserve, (order_id.clone(),)).await?;
//!     let receipt = ctx.execute_activity(&charge, (order_id, items)).await?;
//!     Ok(receipt)
//! }
//! ```
//!
//! The first attempt stops at `reserve_stock`: it is recorded as pending
//! and `?` returns the suspension signal. Once an activity worker has run
//! it, the next attempt replays `reserve_stock` from history and stops at
//! `charge_card`, and so on.

mod activity_worker;
mod context;
mod error;
mod registry;
mod worker;

pub use activity_worker::{ActivityTickOutcome, ActivityWorker};
pub use context::{ActivityContext, ReplayContext};
pub use error::{
    BoxError, FunctionKind, HistoryMismatch, RegistryError, Retryable, RunOutcome, SuspendReason,
    WorkflowError,
};
pub use registry::{ActivityRef, BoxFuture, Registry, WorkflowRef};
pub use worker::{TickOutcome, WorkerHandle, WorkflowWorker};
