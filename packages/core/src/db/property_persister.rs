//! Property Row Persistence
//!
//! Properties are never diffed: a node's rows are deleted and the current set
//! is inserted again, in one multi-row statement per batch.

use crate::db::error::DatabaseError;
use crate::models::{PropertyBatch, PropertyRecord};
use libsql::params::Params;
use libsql::{Connection, Value};

/// Rows per INSERT statement, well below SQLite's bound-variable limit
pub const MAX_ROWS_PER_STATEMENT: usize = 500;

/// Reads and writes `property` rows
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyPersister;

impl PropertyPersister {
    pub fn new() -> Self {
        Self
    }

    /// Delete every property row of node `node_id`
    pub async fn delete_for_node(
        &self,
        conn: &Connection,
        node_id: i64,
    ) -> Result<u64, DatabaseError> {
        conn.execute("DELETE FROM property WHERE node_id = ?", [node_id])
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to delete properties of node {}: {}",
                    node_id, e
                ))
            })
    }

    /// Insert all records of a batch, returns the number of rows written
    pub async fn insert_batch(
        &self,
        conn: &Connection,
        batch: &PropertyBatch,
    ) -> Result<usize, DatabaseError> {
        let mut written = 0;
        for chunk in batch.records.chunks(MAX_ROWS_PER_STATEMENT) {
            let placeholders = vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO property (node_id, path, sub, name, value) VALUES {}",
                placeholders
            );

            let mut values = Vec::with_capacity(chunk.len() * 5);
            for record in chunk {
                values.push(Value::Integer(batch.node_id));
                values.push(Value::Text(record.owner_path.clone()));
                values.push(Value::Text(record.owner_sub.clone()));
                values.push(Value::Text(record.name.clone()));
                values.push(Value::Text(record.value.clone()));
            }

            conn.execute(&sql, Params::Positional(values))
                .await
                .map_err(|e| {
                    DatabaseError::sql_execution(format!(
                        "Failed to insert properties of {}: {}",
                        batch.owner, e
                    ))
                })?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Replace the stored properties of the batch's node with the batch
    pub async fn replace(
        &self,
        conn: &Connection,
        batch: &PropertyBatch,
    ) -> Result<usize, DatabaseError> {
        self.delete_for_node(conn, batch.node_id).await?;
        self.insert_batch(conn, batch).await
    }

    /// Stored properties of node `node_id`, ordered by name then insertion
    pub async fn load_for_node(
        &self,
        conn: &Connection,
        node_id: i64,
    ) -> Result<Vec<PropertyRecord>, DatabaseError> {
        let mut stmt = conn
            .prepare(
                "SELECT path, sub, name, value FROM property WHERE node_id = ? ORDER BY name, id",
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt.query([node_id]).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(PropertyRecord {
                node_id: Some(node_id),
                owner_path: row.get::<String>(0)?,
                owner_sub: row.get::<String>(1)?,
                name: row.get::<String>(2)?,
                value: row.get::<String>(3)?,
            });
        }
        Ok(records)
    }
}
