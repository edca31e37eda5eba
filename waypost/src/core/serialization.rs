use super::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Compute a stable fingerprint of a JSON payload.
///
/// SeaHash is stable across compiler versions and machines, so a fingerprint
/// logged by one worker can be compared with one logged by another. Used in
/// history mismatch diagnostics; equality itself is decided on the values.
pub fn hash_value(value: &Value) -> u64 {
    // Value's Display impl writes compact JSON and never fails.
    seahash::hash(value.to_string().as_bytes())
}

/// Serializes a value into a JSON document.
///
/// # Errors
/// Returns `CoreError::Serialization` if the value cannot be serialized.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(CoreError::Serialization)
}

/// Deserializes a JSON document into a value.
///
/// # Errors
/// Returns `CoreError::Deserialization` if the document does not fit `T`.
pub fn deserialize_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(CoreError::Deserialization)
}

/// Structural equality between a recorded payload and freshly supplied
/// arguments.
///
/// Integers and floats compare by value, so `42` recorded by one process
/// matches `42.0` supplied by another.
pub fn payloads_equal(recorded: &Value, current: &Value) -> bool {
    match (recorded, current) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_u64(), b.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| payloads_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| payloads_equal(x, y)))
        }
        _ => recorded == current,
    }
}
