use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Instance '{key}' is locked by {holder}")]
    Locked { key: String, holder: String },
    #[error("Lock on '{key}' is stale (expired or reclaimed)")]
    StaleLock { key: String },
    #[error("Version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Invalid record: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

impl From<StateStoreError> for iam_core::Error {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::Locked { key, holder } => iam_core::Error::Locked { key, holder },
            StateStoreError::StaleLock { key } => iam_core::Error::StaleLock { key },
            StateStoreError::VersionConflict {
                key,
                expected,
                actual,
            } => iam_core::Error::VersionConflict {
                key,
                expected,
                actual,
            },
            StateStoreError::Io(e) => iam_core::Error::Io(e),
            StateStoreError::Serialization(e) => iam_core::Error::Serialization(e),
            other => iam_core::Error::Storage(other.to_string()),
        }
    }
}
