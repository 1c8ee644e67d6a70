//! In-Memory Content Tree
//!
//! A mutable tree held entirely in memory. It can be built node by node or
//! loaded from a JSON snapshot:
//!
//! ```json
//! {
//!   "path": "/content",
//!   "type": "sling:Folder",
//!   "children": [
//!     {
//!       "name": "home",
//!       "type": "cq:Page",
//!       "children": [
//!         {
//!           "name": "jcr:content",
//!           "type": "cq:PageContent",
//!           "resourceType": "site/components/page",
//!           "properties": { "jcr:title": "Home", "hidden": false, "tags": ["a", "b"] }
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! JSON strings map to `String`, booleans to `Boolean`, integers to `Long`,
//! other numbers to `Double` and arrays to multi-valued properties. Other
//! value types use a tagged object: `{"date": "<rfc3339>"}`,
//! `{"decimal": "1.50"}`, `{"binary": "<text>"}`, `{"reference": "<id>"}`.

use super::{ContentTree, PropertyValue, TreeError, TreeNode, TreeProperty};
use crate::utils::paths::parent_path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Entry {
    node_type: String,
    resource_type: Option<String>,
    properties: Vec<TreeProperty>,
    children: Vec<String>,
    modified: DateTime<Utc>,
    unreadable: bool,
}

type Nodes = Arc<RwLock<HashMap<String, Entry>>>;

/// Content tree kept in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryTree {
    nodes: Nodes,
}

impl InMemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a tree from a JSON snapshot document
    pub fn from_json_str(json: &str) -> Result<Self, TreeError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| TreeError::InvalidSnapshot(e.to_string()))?;
        Self::from_json_value(&value)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TreeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TreeError::InvalidSnapshot(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_value(value: &Value) -> Result<Self, TreeError> {
        let tree = Self::new();
        let roots: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for root in roots {
            tree.load_node(None, root)?;
        }
        Ok(tree)
    }

    fn load_node(&self, parent: Option<&str>, value: &Value) -> Result<String, TreeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| TreeError::InvalidSnapshot("node must be an object".to_string()))?;

        let path = match (obj.get("path").and_then(Value::as_str), parent) {
            (Some(path), _) => path.to_string(),
            (None, Some(parent)) => {
                let name = obj.get("name").and_then(Value::as_str).ok_or_else(|| {
                    TreeError::InvalidSnapshot(format!("child of {} has no name", parent))
                })?;
                format!("{}/{}", parent.trim_end_matches('/'), name)
            }
            (None, None) => {
                return Err(TreeError::InvalidSnapshot(
                    "root node must have a path".to_string(),
                ))
            }
        };

        let node_type = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("nt:unstructured");
        let resource_type = obj.get("resourceType").and_then(Value::as_str);

        let mut properties = Vec::new();
        if let Some(props) = obj.get("properties") {
            let props = props.as_object().ok_or_else(|| {
                TreeError::InvalidSnapshot(format!("properties of {} must be an object", path))
            })?;
            for (name, raw) in props {
                properties.push(parse_property(&path, name, raw)?);
            }
        }

        self.insert_node(&path, node_type, resource_type, properties)?;

        if let Some(children) = obj.get("children") {
            let children = children.as_array().ok_or_else(|| {
                TreeError::InvalidSnapshot(format!("children of {} must be an array", path))
            })?;
            for child in children {
                self.load_node(Some(&path), child)?;
            }
        }

        Ok(path)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>>, TreeError> {
        self.nodes
            .write()
            .map_err(|_| TreeError::Unavailable("tree lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>, TreeError> {
        self.nodes
            .read()
            .map_err(|_| TreeError::Unavailable("tree lock poisoned".to_string()))
    }

    /// Insert or replace a node
    ///
    /// The parent must already exist unless `path` is a root. A replaced node
    /// keeps its children.
    pub fn insert_node(
        &self,
        path: &str,
        node_type: &str,
        resource_type: Option<&str>,
        properties: Vec<TreeProperty>,
    ) -> Result<(), TreeError> {
        let mut nodes = self.write()?;

        if let Some(parent) = parent_path(path) {
            if let Some(parent_entry) = nodes.get_mut(parent) {
                if !parent_entry.children.iter().any(|c| c == path) {
                    parent_entry.children.push(path.to_string());
                }
            } else if !nodes.is_empty() {
                return Err(TreeError::read_failed(parent, "parent node does not exist"));
            }
        }

        let children = nodes
            .get(path)
            .map(|existing| existing.children.clone())
            .unwrap_or_default();
        nodes.insert(
            path.to_string(),
            Entry {
                node_type: node_type.to_string(),
                resource_type: resource_type.map(str::to_string),
                properties,
                children,
                modified: Utc::now(),
                unreadable: false,
            },
        );
        Ok(())
    }

    /// Set (or replace) one property and mark the node modified
    pub fn set_property(&self, path: &str, property: TreeProperty) -> Result<(), TreeError> {
        let mut nodes = self.write()?;
        let entry = nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::read_failed(path, "node does not exist"))?;
        entry.properties.retain(|p| p.name != property.name);
        entry.properties.push(property);
        entry.modified = Utc::now();
        Ok(())
    }

    /// Remove one property and mark the node modified
    pub fn remove_property(&self, path: &str, name: &str) -> Result<(), TreeError> {
        let mut nodes = self.write()?;
        let entry = nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::read_failed(path, "node does not exist"))?;
        entry.properties.retain(|p| p.name != name);
        entry.modified = Utc::now();
        Ok(())
    }

    /// Remove a node and its whole subtree, returns the number of nodes removed
    pub fn remove_node(&self, path: &str) -> Result<usize, TreeError> {
        let mut nodes = self.write()?;
        if let Some(parent) = parent_path(path) {
            if let Some(parent_entry) = nodes.get_mut(parent) {
                parent_entry.children.retain(|c| c != path);
            }
        }

        let mut removed = 0;
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = nodes.remove(&current) {
                removed += 1;
                stack.extend(entry.children);
            }
        }
        Ok(removed)
    }

    /// Set the modification time of a node
    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<(), TreeError> {
        let mut nodes = self.write()?;
        let entry = nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::read_failed(path, "node does not exist"))?;
        entry.modified = modified;
        Ok(())
    }

    /// Mark a node modified now
    pub fn touch(&self, path: &str) -> Result<(), TreeError> {
        self.set_modified(path, Utc::now())
    }

    /// Make reading the children of `path` fail, as an access-denied subtree
    /// would in a real repository
    pub fn set_unreadable(&self, path: &str, unreadable: bool) -> Result<(), TreeError> {
        let mut nodes = self.write()?;
        let entry = nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::read_failed(path, "node does not exist"))?;
        entry.unreadable = unreadable;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().map(|nodes| nodes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node_handle(&self, path: &str, entry: &Entry) -> Arc<dyn TreeNode> {
        Arc::new(MemoryNode {
            path: path.to_string(),
            node_type: entry.node_type.clone(),
            resource_type: entry.resource_type.clone(),
            tree: self.clone(),
        })
    }
}

fn parse_property(path: &str, name: &str, raw: &Value) -> Result<TreeProperty, TreeError> {
    let values = match raw {
        Value::Array(items) => items
            .iter()
            .map(|item| parse_value(path, name, item))
            .collect::<Result<Vec<_>, _>>()?,
        single => vec![parse_value(path, name, single)?],
    };
    Ok(TreeProperty::multi(name, values))
}

fn parse_value(path: &str, name: &str, raw: &Value) -> Result<PropertyValue, TreeError> {
    let invalid = |reason: &str| {
        TreeError::InvalidSnapshot(format!("property {} of {}: {}", name, path, reason))
    };

    match raw {
        Value::String(s) => Ok(PropertyValue::String(s.clone())),
        Value::Bool(b) => Ok(PropertyValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(long) => Ok(PropertyValue::Long(long)),
            None => n
                .as_f64()
                .map(PropertyValue::Double)
                .ok_or_else(|| invalid("number out of range")),
        },
        Value::Object(tagged) => {
            let (tag, inner) = tagged
                .iter()
                .next()
                .ok_or_else(|| invalid("empty tagged value"))?;
            let text = inner
                .as_str()
                .ok_or_else(|| invalid("tagged value must be a string"))?;
            match tag.as_str() {
                "date" => DateTime::parse_from_rfc3339(text)
                    .map(PropertyValue::Date)
                    .map_err(|e| invalid(&e.to_string())),
                "decimal" => Ok(PropertyValue::Decimal(text.to_string())),
                "binary" => Ok(PropertyValue::Binary(text.as_bytes().to_vec())),
                "reference" => Ok(PropertyValue::Reference(text.to_string())),
                other => Err(invalid(&format!("unknown value tag `{}`", other))),
            }
        }
        Value::Null | Value::Array(_) => Err(invalid("unsupported value")),
    }
}

struct MemoryNode {
    path: String,
    node_type: String,
    resource_type: Option<String>,
    tree: InMemoryTree,
}

#[async_trait]
impl TreeNode for MemoryNode {
    fn path(&self) -> &str {
        &self.path
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    async fn properties(&self) -> Result<Vec<TreeProperty>, TreeError> {
        let nodes = self.tree.read()?;
        nodes
            .get(&self.path)
            .map(|entry| entry.properties.clone())
            .ok_or_else(|| TreeError::read_failed(&self.path, "node no longer exists"))
    }

    async fn children(&self) -> Result<Vec<Arc<dyn TreeNode>>, TreeError> {
        let nodes = self.tree.read()?;
        let entry = nodes
            .get(&self.path)
            .ok_or_else(|| TreeError::read_failed(&self.path, "node no longer exists"))?;
        if entry.unreadable {
            return Err(TreeError::read_failed(&self.path, "access denied"));
        }
        Ok(entry
            .children
            .iter()
            .filter_map(|child| {
                nodes
                    .get(child)
                    .map(|child_entry| self.tree.node_handle(child, child_entry))
            })
            .collect())
    }
}

#[async_trait]
impl ContentTree for InMemoryTree {
    async fn get_node(&self, path: &str) -> Result<Option<Arc<dyn TreeNode>>, TreeError> {
        let nodes = self.read()?;
        Ok(nodes.get(path).map(|entry| self.node_handle(path, entry)))
    }

    async fn nodes_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Arc<dyn TreeNode>>, TreeError> {
        let nodes = self.read()?;
        let mut modified: Vec<(&String, &Entry)> = nodes
            .iter()
            .filter(|(_, entry)| entry.modified >= since)
            .collect();
        modified.sort_by(|a, b| a.0.cmp(b.0));
        Ok(modified
            .into_iter()
            .map(|(path, entry)| self.node_handle(path, entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "path": "/content",
        "type": "sling:Folder",
        "children": [
            {
                "name": "home",
                "type": "cq:Page",
                "children": [
                    {
                        "name": "jcr:content",
                        "type": "cq:PageContent",
                        "resourceType": "site/page",
                        "properties": {
                            "jcr:title": "Home",
                            "hidden": false,
                            "rank": 3,
                            "weight": 1.5,
                            "tags": ["a", "b"],
                            "published": { "date": "2020-05-01T10:30:00+02:00" }
                        }
                    }
                ]
            },
            { "name": "about", "type": "cq:Page" }
        ]
    }"#;

    #[tokio::test]
    async fn test_load_snapshot() {
        let tree = InMemoryTree::from_json_str(SNAPSHOT).unwrap();
        assert_eq!(tree.len(), 4);

        let root = tree.get_node("/content").await.unwrap().unwrap();
        let children: Vec<String> = root
            .children()
            .await
            .unwrap()
            .iter()
            .map(|c| c.path().to_string())
            .collect();
        assert_eq!(children, vec!["/content/home", "/content/about"]);

        let content = tree
            .get_node("/content/home/jcr:content")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.node_type(), "cq:PageContent");
        assert_eq!(content.resource_type(), Some("site/page"));

        let props = content.properties().await.unwrap();
        let find = |name: &str| props.iter().find(|p| p.name == name).unwrap().clone();
        assert_eq!(find("hidden").values, vec![PropertyValue::Boolean(false)]);
        assert_eq!(find("rank").values, vec![PropertyValue::Long(3)]);
        assert_eq!(find("weight").values, vec![PropertyValue::Double(1.5)]);
        assert_eq!(find("tags").values.len(), 2);
        assert!(matches!(find("published").values[0], PropertyValue::Date(_)));
    }

    #[tokio::test]
    async fn test_missing_node_is_none() {
        let tree = InMemoryTree::from_json_str(SNAPSHOT).unwrap();
        assert!(tree.get_node("/content/nope").await.unwrap().is_none());
    }

    #[test]
    fn test_invalid_snapshot_is_rejected() {
        assert!(InMemoryTree::from_json_str("[1, 2]").is_err());
        assert!(InMemoryTree::from_json_str(r#"{"type": "x"}"#).is_err());
        assert!(InMemoryTree::from_json_str(
            r#"{"path": "/c", "properties": {"bad": {"color": "red"}}}"#
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let tree = InMemoryTree::from_json_str(SNAPSHOT).unwrap();
        assert_eq!(tree.remove_node("/content/home").unwrap(), 2);
        assert!(tree.get_node("/content/home/jcr:content").await.unwrap().is_none());

        let root = tree.get_node("/content").await.unwrap().unwrap();
        assert_eq!(root.children().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nodes_modified_since() {
        let tree = InMemoryTree::from_json_str(SNAPSHOT).unwrap();
        let old = Utc::now() - chrono::Duration::hours(2);
        for path in ["/content", "/content/home", "/content/home/jcr:content", "/content/about"] {
            tree.set_modified(path, old).unwrap();
        }

        let checkpoint = Utc::now() - chrono::Duration::hours(1);
        assert!(tree.nodes_modified_since(checkpoint).await.unwrap().is_empty());

        tree.touch("/content/about").unwrap();
        let modified = tree.nodes_modified_since(checkpoint).await.unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].path(), "/content/about");
    }

    #[tokio::test]
    async fn test_unreadable_children() {
        let tree = InMemoryTree::from_json_str(SNAPSHOT).unwrap();
        tree.set_unreadable("/content/home", true).unwrap();
        let home = tree.get_node("/content/home").await.unwrap().unwrap();
        assert!(matches!(
            home.children().await,
            Err(TreeError::ReadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_requires_parent() {
        let tree = InMemoryTree::new();
        tree.insert_node("/content", "sling:Folder", None, vec![]).unwrap();
        assert!(tree
            .insert_node("/content/a/b", "cq:Page", None, vec![])
            .is_err());
        tree.insert_node("/content/a", "cq:Page", None, vec![]).unwrap();
        tree.set_property(
            "/content/a",
            TreeProperty::single("title", PropertyValue::String("A".into())),
        )
        .unwrap();
        let node = tree.get_node("/content/a").await.unwrap().unwrap();
        assert_eq!(node.properties().await.unwrap().len(), 1);
    }
}
