use serde::de::DeserializeOwned;
use serde_json::Value;

/// A typed decode that failed at a specific key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("at {path} → {message}")]
pub struct DecodeError {
    /// Dotted path inside the decoded node, `.` for the root.
    pub path: String,
    pub message: String,
}

fn wrap(err: serde_path_to_error::Error<serde_json::Error>) -> DecodeError {
    let path = err.path().to_string();
    DecodeError { path, message: err.into_inner().to_string() }
}

/// Decode an already-parsed node into `T`, keeping the failing key path.
pub fn from_value_with_path<T: DeserializeOwned>(value: &Value) -> Result<T, DecodeError> {
    serde_path_to_error::deserialize::<_, T>(value).map_err(wrap)
}

pub fn from_slice_with_path<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let de = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize::<_, T>(de).map_err(wrap)
}
