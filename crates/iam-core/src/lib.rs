//! Core types and utilities for the iamctl engine
//!
//! # Modules
//!
//! - `change`: Planned action for a resource instance
//! - `config`: Environment loading and engine configuration
//! - `error`: Error taxonomy and Result alias
//! - `events`: Structured engine events and the sink interface
//! - `logging`: tracing subscriber setup
//! - `provider_source`: Provider source strings (`github:OWNER/REPO`)
//! - `types`: Resource types, attribute values, instances and state records

pub mod change;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod provider_source;
pub mod types;

// Re-exports
pub use change::ChangeAction;
pub use config::{EngineConfig, StateBackendKind};
pub use error::{Error, FieldError, Result};
pub use events::{EngineEvent, EventSink, MemorySink, Phase, TracingSink};
pub use logging::{init_logging, LogConfig};
pub use types::*;
