//! Error types for the iamctl engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single attribute-level problem reported by the schema or a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unexpected wire payload
    #[error("Protocol error in field '{field}': {message}")]
    Protocol { field: String, message: String },

    #[error("Provider did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Channel closed")]
    ChannelClosed,

    /// The provider answered with a JSON-RPC error object
    #[error("Provider error {code}: {message}")]
    Provider { code: i32, message: String },

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

    #[error("Cyclic dependency between instances: {}", .keys.join(", "))]
    CyclicDependency { keys: Vec<String> },

    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    #[error("Resource type already registered: {0}")]
    DuplicateType(String),

    #[error("Unknown attribute '{attribute}' for resource type {type_id}")]
    UnknownAttribute { type_id: String, attribute: String },

    #[error("Validation failed: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error naming the offending field
    pub fn protocol(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Contention or unresponsiveness that an operator may retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Locked { .. } | Error::Timeout(_))
    }

    /// Integrity or configuration problems that must not be retried blindly
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownType(_)
                | Error::DuplicateType(_)
        )
    }

    /// Field errors carried by a validation failure
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Error::Validation(errors) => errors,
            _ => &[],
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
