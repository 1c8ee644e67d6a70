//! Change notifications queued for reconciliation

use serde::{Deserialize, Serialize};

/// What happened to a path in the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// The path was removed. Ordered before `Update` so a drained batch
    /// applies deletions first for the same path.
    Delete,
    /// The path was created or modified
    Update,
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOperation::Delete => write!(f, "delete"),
            ChangeOperation::Update => write!(f, "update"),
        }
    }
}

/// A pending operation on one path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub operation: ChangeOperation,
}

impl ChangeEvent {
    pub fn update(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Update,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            operation: ChangeOperation::Delete,
        }
    }
}
