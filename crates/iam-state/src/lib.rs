//! iam-state: change planning and reconciliation
//!
//! Provides:
//! - Diff engine computing per-instance actions and ordered change plans
//! - Change plans with content hash and summary
//! - Reconciliation orchestrator driving providers and the state store

pub mod change;
pub mod diff;
pub mod reconciler;

pub use change::{ChangeAction, ChangePlan, PlanSummary, PlannedChange};
pub use diff::DiffEngine;
pub use reconciler::{
    CancelHandle, InstanceOutcome, InstanceStatus, Mode, ReconcileReport, Reconciler,
    ReconcilerBuilder,
};

// Re-export state store types
pub use iam_state_store::{SchemaRegistry, StateBackend, StateStore, StateStoreError};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::change::{ChangeAction, ChangePlan, PlannedChange};
    pub use super::diff::DiffEngine;
    pub use super::reconciler::{InstanceStatus, Mode, ReconcileReport, Reconciler};
    pub use iam_state_store::{SchemaRegistry, StateStore};
}
