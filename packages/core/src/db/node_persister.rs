//! Node Row Persistence
//!
//! SQL for the `node` table. All methods take the connection of the caller's
//! transaction, so they see the caller's uncommitted writes.

use crate::db::error::DatabaseError;
use crate::models::{ContentNode, NodeKey};
use libsql::{Connection, Row, Value};

/// A node row as stored, with its id and resolved parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNode {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub node: ContentNode,
}

/// Reads and writes `node` rows
#[derive(Debug, Clone, Copy, Default)]
pub struct NodePersister;

impl NodePersister {
    pub fn new() -> Self {
        Self
    }

    /// Id of the row keyed by `key`, if present
    pub async fn find_id(
        &self,
        conn: &Connection,
        key: &NodeKey,
    ) -> Result<Option<i64>, DatabaseError> {
        let mut stmt = conn
            .prepare("SELECT id FROM node WHERE path = ? AND sub = ?")
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt
            .query([key.path.as_str(), key.sub.as_str()])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to look up node {}: {}", key, e))
            })?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    /// Insert a new row and return its id
    pub async fn insert(
        &self,
        conn: &Connection,
        node: &ContentNode,
        parent_id: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        conn.execute(
            "INSERT INTO node (path, site, sub, resource_type, type, title, parent_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                node.path.as_str(),
                node.site.as_str(),
                node.sub.as_str(),
                node.resource_type.as_str(),
                node.node_type.as_str(),
                node.title.as_str(),
                parent_id,
            ),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to insert node {}: {}", node.key(), e))
        })?;

        Ok(conn.last_insert_rowid())
    }

    /// Overwrite every mutable column of row `id`
    pub async fn update(
        &self,
        conn: &Connection,
        id: i64,
        node: &ContentNode,
        parent_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        conn.execute(
            "UPDATE node SET site = ?, resource_type = ?, type = ?, title = ?, parent_id = ?
             WHERE id = ?",
            (
                node.site.as_str(),
                node.resource_type.as_str(),
                node.node_type.as_str(),
                node.title.as_str(),
                parent_id,
                id,
            ),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to update node {}: {}", node.key(), e))
        })?;
        Ok(())
    }

    /// Delete the rows of a source path and everything below it
    ///
    /// Property rows go first, then node rows. Returns the number of node
    /// rows removed.
    pub async fn delete_subtree(
        &self,
        conn: &Connection,
        source_path: &str,
    ) -> Result<u64, DatabaseError> {
        let key = NodeKey::from_source_path(source_path);

        let (node_filter, params): (&str, Vec<Value>) = if key.sub.is_empty() {
            (
                "path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
                vec![Value::Text(key.path.clone())],
            )
        } else {
            (
                "path = ?1 AND (sub = ?2 OR substr(sub, 1, length(?2) + 1) = ?2 || '/')",
                vec![Value::Text(key.path.clone()), Value::Text(key.sub.clone())],
            )
        };

        conn.execute(
            &format!(
                "DELETE FROM property WHERE node_id IN (SELECT id FROM node WHERE {})",
                node_filter
            ),
            libsql::params::Params::Positional(params.clone()),
        )
        .await
        .map_err(|e| {
            DatabaseError::sql_execution(format!(
                "Failed to delete properties below {}: {}",
                source_path, e
            ))
        })?;

        let removed = conn
            .execute(
                &format!("DELETE FROM node WHERE {}", node_filter),
                libsql::params::Params::Positional(params),
            )
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to delete nodes below {}: {}",
                    source_path, e
                ))
            })?;

        Ok(removed)
    }

    /// Remove every property and node row
    pub async fn truncate(&self, conn: &Connection) -> Result<(), DatabaseError> {
        for table in ["property", "node"] {
            conn.execute(&format!("DELETE FROM {}", table), ())
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!("Failed to truncate {}: {}", table, e))
                })?;
        }
        Ok(())
    }

    /// Load the stored row keyed by `key`
    pub async fn load(
        &self,
        conn: &Connection,
        key: &NodeKey,
    ) -> Result<Option<StoredNode>, DatabaseError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, path, site, sub, resource_type, type, title, parent_id
                 FROM node WHERE path = ? AND sub = ?",
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt.query([key.path.as_str(), key.sub.as_str()]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_stored_node(&row)?)),
            None => Ok(None),
        }
    }

    /// All stored rows below (and including) a page path, ordered by path and sub
    pub async fn list_under(
        &self,
        conn: &Connection,
        page_path: &str,
    ) -> Result<Vec<StoredNode>, DatabaseError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, path, site, sub, resource_type, type, title, parent_id
                 FROM node
                 WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'
                 ORDER BY path, sub",
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt.query([page_path]).await?;

        let mut nodes = Vec::new();
        while let Some(row) = rows.next().await? {
            nodes.push(row_to_stored_node(&row)?);
        }
        Ok(nodes)
    }
}

fn row_to_stored_node(row: &Row) -> Result<StoredNode, DatabaseError> {
    let parent_id = match row.get_value(7)? {
        Value::Integer(id) => Some(id),
        Value::Null => None,
        other => {
            return Err(DatabaseError::corrupt_row(
                "node",
                format!("parent_id is not an integer: {:?}", other),
            ))
        }
    };

    Ok(StoredNode {
        id: row.get::<i64>(0)?,
        parent_id,
        node: ContentNode {
            path: row.get::<String>(1)?,
            site: row.get::<String>(2)?,
            sub: row.get::<String>(3)?,
            resource_type: row.get::<String>(4)?,
            node_type: row.get::<String>(5)?,
            title: row.get::<String>(6)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use tempfile::TempDir;

    fn node(source_path: &str) -> ContentNode {
        let key = NodeKey::from_source_path(source_path);
        ContentNode {
            site: crate::utils::paths::site_path(&key.path).to_string(),
            title: crate::utils::paths::node_name(source_path).to_string(),
            path: key.path,
            sub: key.sub,
            resource_type: String::new(),
            node_type: "nt:unstructured".to_string(),
        }
    }

    async fn setup() -> (TempDir, DatabaseService) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new_local(temp_dir.path().join("mirror.db"))
            .await
            .unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_insert_find_and_update() {
        let (_temp_dir, db) = setup().await;
        let conn = db.connect_with_timeout().await.unwrap();
        let persister = NodePersister::new();

        let root = node("/content/site");
        let root_id = persister.insert(&conn, &root, None).await.unwrap();
        let page = node("/content/site/home");
        let page_id = persister.insert(&conn, &page, Some(root_id)).await.unwrap();

        assert_eq!(
            persister.find_id(&conn, &page.key()).await.unwrap(),
            Some(page_id)
        );

        let mut changed = page.clone();
        changed.title = "Home".to_string();
        changed.resource_type = "site/page".to_string();
        persister
            .update(&conn, page_id, &changed, Some(root_id))
            .await
            .unwrap();

        let stored = persister.load(&conn, &page.key()).await.unwrap().unwrap();
        assert_eq!(stored.id, page_id);
        assert_eq!(stored.parent_id, Some(root_id));
        assert_eq!(stored.node, changed);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let (_temp_dir, db) = setup().await;
        let conn = db.connect_with_timeout().await.unwrap();
        let persister = NodePersister::new();

        persister.insert(&conn, &node("/content/a"), None).await.unwrap();
        assert!(persister.insert(&conn, &node("/content/a"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_subtree_respects_segments() {
        let (_temp_dir, db) = setup().await;
        let conn = db.connect_with_timeout().await.unwrap();
        let persister = NodePersister::new();

        for path in [
            "/content/a",
            "/content/a/jcr:content",
            "/content/a/child",
            "/content/ab",
        ] {
            persister.insert(&conn, &node(path), None).await.unwrap();
        }

        let removed = persister.delete_subtree(&conn, "/content/a").await.unwrap();
        assert_eq!(removed, 3);

        let remaining = persister.list_under(&conn, "/content").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node.path, "/content/ab");
    }

    #[tokio::test]
    async fn test_delete_inside_page_content() {
        let (_temp_dir, db) = setup().await;
        let conn = db.connect_with_timeout().await.unwrap();
        let persister = NodePersister::new();

        for path in [
            "/content/a",
            "/content/a/jcr:content",
            "/content/a/jcr:content/par",
            "/content/a/jcr:content/par/text",
            "/content/a/jcr:content/parx",
        ] {
            persister.insert(&conn, &node(path), None).await.unwrap();
        }

        let removed = persister
            .delete_subtree(&conn, "/content/a/jcr:content/par")
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let subs: Vec<String> = persister
            .list_under(&conn, "/content/a")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.node.sub)
            .collect();
        assert_eq!(subs, vec!["", "jcr:content", "jcr:content/parx"]);
    }

    #[tokio::test]
    async fn test_parent_deletion_nulls_pointer() {
        let (_temp_dir, db) = setup().await;
        let conn = db.connect_with_timeout().await.unwrap();
        let persister = NodePersister::new();

        let root_id = persister.insert(&conn, &node("/content"), None).await.unwrap();
        persister
            .insert(&conn, &node("/other"), Some(root_id))
            .await
            .unwrap();

        persister.delete_subtree(&conn, "/content").await.unwrap();
        let orphan = persister
            .load(&conn, &NodeKey::new("/other", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(orphan.parent_id, None);
    }
}
