use crate::core::CoreError;
use thiserror::Error;

/// Storage layer error type for the waypost workflow engine.
///
/// This error type wraps underlying database and serialization errors
/// while preserving the full error chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "postgres")]
    #[error("database operation failed: {0}")]
    Database(#[from] sqlx::Error),

    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Could not connect to the backing store.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A write would break a uniqueness or reference constraint.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// The requested workflow run was not found in storage.
    #[error("workflow run not found: {0}")]
    WorkflowRunNotFound(String),

    /// The requested activity run was not found in storage.
    #[error("activity run not found: {0}")]
    ActivityRunNotFound(String),
}

impl StorageError {
    /// Returns true if the fault lies with the connection to the store
    /// rather than with the data, so the same transaction may succeed on a
    /// later attempt.
    ///
    /// Serialization failures and deadlocks (SQLSTATE `40001`, `40P01`) and
    /// connection exceptions (class `08`) count as transient. Constraint
    /// violations, missing rows and decoding errors do not.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Connection(_) => true,
            #[cfg(feature = "postgres")]
            StorageError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

#[cfg(feature = "postgres")]
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("40001" | "40P01") => true,
            Some(code) => code.starts_with("08"),
            None => false,
        },
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_faults_are_transient() {
        assert!(StorageError::Connection("refused".into()).is_transient());
        assert!(!StorageError::Constraint("duplicate key".into()).is_transient());
        assert!(!StorageError::WorkflowRunNotFound("x".into()).is_transient());
        assert!(!StorageError::ActivityRunNotFound("x".into()).is_transient());
        assert!(!StorageError::Core(CoreError::InvalidStatus {
            kind: "workflow",
            value: "bogus".into(),
        }).is_transient());
    }

    #[cfg(feature = "postgres")]
    #[test]
    fn test_sqlx_faults() {
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
