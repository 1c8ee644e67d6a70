//! Mirrored Node and Property Rows
//!
//! `ContentNode` and `PropertyRecord` are the relational shape of one source
//! tree node. They are produced by `NodeTransform` and consumed by the
//! persisters.
//!
//! # Identity
//!
//! A node row is identified by `(path, sub)`. `path` is the page path (the
//! part of the source path above the `jcr:content` boundary) and `sub` is the
//! segment from `jcr:content` downwards, empty for the page node itself.

use crate::utils::paths;
use serde::{Deserialize, Serialize};

/// Identity key of a mirrored node row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub path: String,
    pub sub: String,
}

impl NodeKey {
    pub fn new(path: impl Into<String>, sub: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sub: sub.into(),
        }
    }

    /// Key of the row for a raw source tree path
    pub fn from_source_path(source_path: &str) -> Self {
        Self::new(paths::page_path(source_path), paths::sub_path(source_path))
    }

    /// Key of the logical parent row, `None` at the top of the tree
    pub fn parent(&self) -> Option<NodeKey> {
        paths::parent_identity(&self.path, &self.sub).map(|(path, sub)| NodeKey { path, sub })
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sub.is_empty() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}/{}", self.path, self.sub)
        }
    }
}

/// One row of the `node` table, before it has been given an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNode {
    pub path: String,
    pub site: String,
    pub sub: String,
    pub resource_type: String,
    pub node_type: String,
    pub title: String,
}

impl ContentNode {
    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.path.clone(), self.sub.clone())
    }

    /// Identity of the parent row, derived from the path strings
    pub fn parent_key(&self) -> Option<NodeKey> {
        self.key().parent()
    }
}

/// One row of the `property` table
///
/// `node_id` is filled in once the owning node row has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    pub node_id: Option<i64>,
    pub owner_path: String,
    pub owner_sub: String,
    pub name: String,
    pub value: String,
}

impl PropertyRecord {
    pub fn new(owner: &NodeKey, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            node_id: None,
            owner_path: owner.path.clone(),
            owner_sub: owner.sub.clone(),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Property rows of a single node, written atomically by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBatch {
    pub node_id: i64,
    pub owner: NodeKey,
    pub records: Vec<PropertyRecord>,
}

impl PropertyBatch {
    /// Attach every record to `node_id`
    pub fn new(node_id: i64, owner: NodeKey, mut records: Vec<PropertyRecord>) -> Self {
        for record in &mut records {
            record.node_id = Some(node_id);
        }
        Self {
            node_id,
            owner,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_source_path_splits_at_content_boundary() {
        let key = NodeKey::from_source_path("/content/site/page/jcr:content/par/text");
        assert_eq!(key.path, "/content/site/page");
        assert_eq!(key.sub, "jcr:content/par/text");
        assert_eq!(key.to_string(), "/content/site/page/jcr:content/par/text");
    }

    #[test]
    fn test_parent_key_walks_sub_then_path() {
        let key = NodeKey::new("/content/site/page", "jcr:content/par");
        let parent = key.parent().unwrap();
        assert_eq!(parent, NodeKey::new("/content/site/page", "jcr:content"));

        let grand = parent.parent().unwrap();
        assert_eq!(grand, NodeKey::new("/content/site/page", ""));

        let great = grand.parent().unwrap();
        assert_eq!(great, NodeKey::new("/content/site", ""));
    }

    #[test]
    fn test_batch_attaches_node_id() {
        let owner = NodeKey::new("/content/a", "");
        let batch = PropertyBatch::new(
            42,
            owner.clone(),
            vec![
                PropertyRecord::new(&owner, "title", "A"),
                PropertyRecord::new(&owner, "tags", "x"),
            ],
        );

        assert_eq!(batch.len(), 2);
        assert!(batch.records.iter().all(|r| r.node_id == Some(42)));
    }
}
