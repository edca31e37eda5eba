use thiserror::Error;

/// Core error type for the waypost workflow engine.
///
/// Raised while converting between Rust values and the JSON payloads kept
/// in the run store, and while parsing persisted status strings.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Serialization failed when encoding a value to JSON.
    #[error("serialization failed")]
    Serialization(#[source] serde_json::Error),

    /// Deserialization failed when decoding JSON to a value.
    #[error("deserialization failed")]
    Deserialization(#[source] serde_json::Error),

    /// An invalid status string was encountered during parsing.
    #[error("invalid {kind} status: {value}")]
    InvalidStatus { kind: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
