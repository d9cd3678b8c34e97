//! Change plans and their content hash

use iam_core::{Attributes, ResourceTypeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub use iam_core::ChangeAction;

/// One entry of a change plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub instance_key: String,
    pub type_id: ResourceTypeId,
    pub action: ChangeAction,
    /// Last applied attributes, if a record exists
    pub before: Option<Attributes>,
    /// Desired attributes, absent for a delete
    pub after: Option<Attributes>,
    /// Keys that must be processed before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlannedChange {
    pub fn is_noop(&self) -> bool {
        self.action.is_noop()
    }
}

/// Ordered set of changes for a desired configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub changes: Vec<PlannedChange>,
    /// SHA-256 over the ordered changes
    pub hash: String,
}

impl ChangePlan {
    pub fn new(changes: Vec<PlannedChange>) -> Self {
        let hash = Self::compute_hash(&changes);
        Self { changes, hash }
    }

    /// Compute hash of the ordered changes
    pub fn compute_hash(changes: &[PlannedChange]) -> String {
        let mut hasher = Sha256::new();
        for change in changes {
            hasher.update(change.instance_key.as_bytes());
            hasher.update(change.type_id.to_string().as_bytes());
            hasher.update(serde_json::to_string(&change.action).unwrap_or_default().as_bytes());
            hasher.update(serde_json::to_string(&change.before).unwrap_or_default().as_bytes());
            hasher.update(serde_json::to_string(&change.after).unwrap_or_default().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Verify the hash matches the changes
    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.changes) == self.hash
    }

    pub fn get(&self, key: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.instance_key == key)
    }

    /// Keys in execution order
    pub fn keys(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.instance_key.as_str()).collect()
    }

    /// True if anything other than no-ops is planned
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| !c.is_noop())
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                ChangeAction::NoOp => summary.unchanged += 1,
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update { .. } => summary.update += 1,
                ChangeAction::Delete => summary.delete += 1,
                ChangeAction::Replace { .. } => summary.replace += 1,
            }
        }
        summary
    }
}

/// Per-action counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    /// Number of entries that change something
    pub fn changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.unchanged
        )
    }
}
