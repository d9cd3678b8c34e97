//! iam-state-store: schema registry and persisted instance state
//!
//! Provides the last-known state of every managed resource instance with
//! per-instance lease locking (shared between processes for the file and
//! SQLite backends) and optimistic versioning.
//!
//! Features:
//! - Frozen schema registry with validation, state decoding and redaction
//! - In-memory, JSON file and SQLite backends
//! - Prometheus metrics

pub mod error;
pub mod file_store;
pub mod memory_store;
pub mod metrics;
pub mod schema_registry;
pub mod sqlite_store;
pub mod state_store;

use std::sync::Arc;

use iam_core::StateBackendKind;

pub use error::StateStoreError;
pub use file_store::FileBackend;
pub use memory_store::MemoryBackend;
pub use schema_registry::SchemaRegistry;
pub use sqlite_store::SqliteBackend;
pub use state_store::{SharedLease, StateBackend, StateStore};

/// Open the configured backend and wrap it in a store
pub async fn open_store(kind: &StateBackendKind) -> error::Result<StateStore> {
    let backend: Arc<dyn StateBackend> = match kind {
        StateBackendKind::Memory => Arc::new(MemoryBackend::new()),
        StateBackendKind::File(path) => Arc::new(FileBackend::new(path.clone())),
        StateBackendKind::Sqlite(url) => Arc::new(SqliteBackend::new(url).await?),
    };
    Ok(StateStore::new(backend))
}
