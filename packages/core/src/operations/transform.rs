//! Node Transform
//!
//! Maps one source tree node to its `node` row and `property` rows.

use crate::db::SyncMetrics;
use crate::models::{ContentNode, NodeKey, PropertyRecord};
use crate::tree::{TreeError, TreeNode};
use crate::utils::paths;
use crate::utils::values::value_to_string;
use std::time::Instant;

/// Converts tree nodes into mirror rows
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTransform;

impl NodeTransform {
    pub fn new() -> Self {
        Self
    }

    /// Row for `node`; the title is the last path segment
    pub fn to_content_node(&self, node: &dyn TreeNode, metrics: &SyncMetrics) -> ContentNode {
        let started = Instant::now();
        let key = NodeKey::from_source_path(node.path());
        let content_node = ContentNode {
            site: paths::site_path(&key.path).to_string(),
            title: paths::node_name(node.path()).to_string(),
            path: key.path,
            sub: key.sub,
            resource_type: node.resource_type().unwrap_or_default().to_string(),
            node_type: node.node_type().to_string(),
        };
        metrics.record("transform.node", started.elapsed());
        content_node
    }

    /// One record per textual property value
    ///
    /// Multi-valued properties yield one record per value, all with the same
    /// name. Values without a text form are skipped.
    pub async fn to_property_records(
        &self,
        node: &dyn TreeNode,
        owner: &NodeKey,
        metrics: &SyncMetrics,
    ) -> Result<Vec<PropertyRecord>, TreeError> {
        let started = Instant::now();
        let properties = node.properties().await?;

        let mut records = Vec::new();
        for property in &properties {
            for value in &property.values {
                match value_to_string(value) {
                    Some(text) => records.push(PropertyRecord::new(owner, &property.name, text)),
                    None => tracing::debug!(
                        "Skipping non-textual value of {} on {}",
                        property.name,
                        node.path()
                    ),
                }
            }
        }

        metrics.record("transform.properties", started.elapsed());
        Ok(records)
    }
}
