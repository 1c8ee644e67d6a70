//! Source Tree Capability Interface
//!
//! The engine reads the content tree through two narrow traits and never
//! mutates it. Any repository can be mirrored by implementing [`ContentTree`]
//! and [`TreeNode`]; [`memory::InMemoryTree`] is the implementation used by
//! the operator binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use thiserror::Error;

pub use memory::InMemoryTree;

/// Errors raised while reading the source tree
#[derive(Error, Debug, Clone)]
pub enum TreeError {
    /// The tree as a whole cannot be reached
    #[error("Content tree unavailable: {0}")]
    Unavailable(String),

    /// One node (or its children) could not be read
    #[error("Failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// A tree snapshot document is malformed
    #[error("Invalid tree snapshot: {0}")]
    InvalidSnapshot(String),
}

impl TreeError {
    pub fn read_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Typed value of a source tree property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Boolean(bool),
    Long(i64),
    Double(f64),
    Date(DateTime<FixedOffset>),
    /// Arbitrary precision decimal in its textual form
    Decimal(String),
    Binary(Vec<u8>),
    /// Identifier of another node
    Reference(String),
}

/// A named, possibly multi-valued property
#[derive(Debug, Clone, PartialEq)]
pub struct TreeProperty {
    pub name: String,
    pub values: Vec<PropertyValue>,
}

impl TreeProperty {
    pub fn single(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            values: vec![value],
        }
    }

    pub fn multi(name: impl Into<String>, values: Vec<PropertyValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// One node of the source tree
#[async_trait]
pub trait TreeNode: Send + Sync {
    fn path(&self) -> &str;

    /// Primary node type
    fn node_type(&self) -> &str;

    fn resource_type(&self) -> Option<&str>;

    async fn properties(&self) -> Result<Vec<TreeProperty>, TreeError>;

    /// Direct children in source order
    async fn children(&self) -> Result<Vec<Arc<dyn TreeNode>>, TreeError>;
}

/// Read access to the whole source tree
#[async_trait]
pub trait ContentTree: Send + Sync {
    /// Node at `path`, `None` when it does not exist
    async fn get_node(&self, path: &str) -> Result<Option<Arc<dyn TreeNode>>, TreeError>;

    /// Nodes modified at or after `since`
    async fn nodes_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Arc<dyn TreeNode>>, TreeError>;
}
