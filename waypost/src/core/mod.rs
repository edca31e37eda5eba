//! Core types and utilities for the waypost workflow engine.
//!
//! # Domain Model
//! - [`WorkflowDefinition`]: A named workflow type known to the store
//! - [`WorkflowRun`]: One invocation of a workflow and its lifecycle state
//! - [`ActivityRun`]: One scheduled activity call; a run's ordered activity
//!   runs form its history
//! - [`WorkflowStatus`] / [`ActivityStatus`]: Persisted state machines
//!
//! # Serialization
//! - [`serialize_value`]: Convert Rust types to JSON for storage
//! - [`deserialize_value`]: Convert JSON back to Rust types
//! - [`payloads_equal`]: Structural comparison used during replay
//! - [`hash_value`]: Stable fingerprints for diagnostics
//!
//! # Error Handling
//! - [`CoreError`]: Core error type with proper error chains
//! - [`Result<T>`]: Type alias for Results using CoreError
//!
//! # Example
//!
//! ```
//! use waypost::core::{serialize_value, WorkflowRun, WorkflowStatus};
//!
//! let input = serialize_value(&("test", 42)).unwrap();
//! let run = WorkflowRun::pending("greet", input);
//! assert_eq!(run.status, WorkflowStatus::Pending);
//! ```

mod error;
mod id;
mod run;
mod serialization;

pub use error::{CoreError, Result};
pub use id::generate_readable_id;
pub use run::{ActivityRun, ActivityStatus, WorkflowDefinition, WorkflowRun, WorkflowStatus};
pub use serialization::{deserialize_value, hash_value, payloads_equal, serialize_value};
