//! Planned action for a single resource instance

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the engine intends to do with one instance. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    NoOp,
    Create,
    /// In-place update of the named attributes
    Update { changed: Vec<String> },
    Delete,
    /// Delete then create; `forced_by` lists the force-replacement attributes that differ
    Replace { forced_by: Vec<String> },
}

impl ChangeAction {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeAction::NoOp => "no_op",
            ChangeAction::Create => "create",
            ChangeAction::Update { .. } => "update",
            ChangeAction::Delete => "delete",
            ChangeAction::Replace { .. } => "replace",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, ChangeAction::NoOp)
    }

    /// Attribute names that triggered the action
    pub fn attributes(&self) -> &[String] {
        match self {
            ChangeAction::Update { changed } => changed,
            ChangeAction::Replace { forced_by } => forced_by,
            _ => &[],
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Update { changed } => write!(f, "update({})", changed.join(", ")),
            ChangeAction::Replace { forced_by } => write!(f, "replace({})", forced_by.join(", ")),
            other => f.write_str(other.name()),
        }
    }
}
