//! Synchronization Visitors
//!
//! A visitor turns one visited tree node into writes against the mirror.
//!
//! - [`UpsertVisitor`] - instant, periodic and direct updates: insert or
//!   update the node row, then replace its properties inline
//! - [`ForceInsertVisitor`] - full re-index: the tables were just truncated,
//!   so node rows are always inserted and property batches go to the
//!   [`BatchWriteQueue`]
//! - [`DeleteVisitor`] - removes the rows of a path and its descendants

use crate::db::{
    Counter, DatabaseError, NodePersister, PropertyPersister, SyncMetrics, SyncTransaction,
};
use crate::models::{NodeKey, PropertyBatch};
use crate::operations::batch_writer::BatchWriteQueue;
use crate::operations::path_cache::PathIdCache;
use crate::operations::transform::NodeTransform;
use crate::operations::SyncError;
use crate::tree::TreeNode;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Writes for one visited node
#[async_trait]
pub trait SyncVisitor: Send {
    /// Persist `node` inside `tx`
    async fn visit(&mut self, tx: &mut SyncTransaction, node: &dyn TreeNode)
        -> Result<(), SyncError>;

    /// Called after the traversal committed `tx`, before it starts the next
    /// transaction
    async fn after_commit(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// State shared by the visitors of one job
#[derive(Debug, Clone)]
pub struct VisitContext {
    pub cache: Arc<PathIdCache>,
    pub metrics: Arc<SyncMetrics>,
    pub transform: NodeTransform,
    pub nodes: NodePersister,
    pub properties: PropertyPersister,
}

impl VisitContext {
    pub fn new(cache: Arc<PathIdCache>, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            cache,
            metrics,
            transform: NodeTransform::new(),
            nodes: NodePersister::new(),
            properties: PropertyPersister::new(),
        }
    }

    /// Id of the row keyed by `key`: cache first, then the database
    pub async fn lookup_id(
        &self,
        tx: &SyncTransaction,
        key: &NodeKey,
    ) -> Result<Option<i64>, DatabaseError> {
        if let Some(id) = self.cache.get(key) {
            return Ok(Some(id));
        }
        let id = self.nodes.find_id(tx.conn(), key).await?;
        if let Some(id) = id {
            self.cache.insert(key.clone(), id);
        }
        Ok(id)
    }

    /// Id of the parent row of `key`, `None` when the parent is not mirrored
    pub async fn resolve_parent_id(
        &self,
        tx: &SyncTransaction,
        key: &NodeKey,
    ) -> Result<Option<i64>, DatabaseError> {
        match key.parent() {
            Some(parent) => self.lookup_id(tx, &parent).await,
            None => Ok(None),
        }
    }
}

/// Insert-or-update visitor with inline property replacement
pub struct UpsertVisitor {
    ctx: VisitContext,
}

impl UpsertVisitor {
    pub fn new(ctx: VisitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SyncVisitor for UpsertVisitor {
    async fn visit(
        &mut self,
        tx: &mut SyncTransaction,
        node: &dyn TreeNode,
    ) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let row = ctx.transform.to_content_node(node, &ctx.metrics);
        let key = row.key();
        let records = ctx
            .transform
            .to_property_records(node, &key, &ctx.metrics)
            .await?;

        tx.ensure_open().await?;
        let existing = ctx.lookup_id(tx, &key).await?;
        let parent_id = ctx.resolve_parent_id(tx, &key).await?;

        let id = match existing {
            Some(id) => {
                let started = Instant::now();
                ctx.nodes.update(tx.conn(), id, &row, parent_id).await?;
                ctx.metrics.record("persist.update", started.elapsed());
                ctx.metrics.increment(Counter::NodesUpdated, 1);
                id
            }
            None => {
                let started = Instant::now();
                let id = ctx.nodes.insert(tx.conn(), &row, parent_id).await?;
                ctx.metrics.record("persist.insert", started.elapsed());
                ctx.metrics.increment(Counter::NodesInserted, 1);
                ctx.cache.insert(key.clone(), id);
                id
            }
        };

        let started = Instant::now();
        let batch = PropertyBatch::new(id, key, records);
        let written = ctx.properties.replace(tx.conn(), &batch).await?;
        ctx.metrics.record("persist.properties", started.elapsed());
        ctx.metrics
            .increment(Counter::PropertiesWritten, written as u64);

        tracing::debug!("Upserted {} ({} properties)", node.path(), written);
        Ok(())
    }
}

/// Insert-only visitor for a freshly truncated mirror
///
/// Property batches of the current commit window are held back and handed to
/// the workers in `after_commit()`, once the node rows they reference are
/// committed. `after_commit()` returns only after every worker committed.
pub struct ForceInsertVisitor {
    ctx: VisitContext,
    queue: Arc<BatchWriteQueue>,
    pending: Vec<PropertyBatch>,
}

impl ForceInsertVisitor {
    pub fn new(ctx: VisitContext, queue: Arc<BatchWriteQueue>) -> Self {
        Self {
            ctx,
            queue,
            pending: Vec::new(),
        }
    }

    /// Batches waiting for the next commit
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    /// Submit the held batches and wait for the workers to commit them
    pub async fn flush(&mut self) -> Result<(), SyncError> {
        for batch in self.pending.drain(..) {
            self.queue.submit(batch).await?;
        }
        let failed = self.queue.commit().await?;
        if failed > 0 {
            tracing::warn!("{} workers failed to commit their batches", failed);
        }
        Ok(())
    }
}

#[async_trait]
impl SyncVisitor for ForceInsertVisitor {
    async fn visit(
        &mut self,
        tx: &mut SyncTransaction,
        node: &dyn TreeNode,
    ) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let row = ctx.transform.to_content_node(node, &ctx.metrics);
        let key = row.key();
        let records = ctx
            .transform
            .to_property_records(node, &key, &ctx.metrics)
            .await?;

        tx.ensure_open().await?;
        let parent_id = ctx.resolve_parent_id(tx, &key).await?;

        let started = Instant::now();
        let id = ctx.nodes.insert(tx.conn(), &row, parent_id).await?;
        ctx.metrics.record("persist.insert", started.elapsed());
        ctx.metrics.increment(Counter::NodesInserted, 1);
        ctx.cache.insert(key.clone(), id);

        if !records.is_empty() {
            self.pending.push(PropertyBatch::new(id, key, records));
        }
        Ok(())
    }

    async fn after_commit(&mut self) -> Result<(), SyncError> {
        self.flush().await
    }
}

/// Removes the rows of a path and all paths below it
pub struct DeleteVisitor {
    ctx: VisitContext,
}

impl DeleteVisitor {
    pub fn new(ctx: VisitContext) -> Self {
        Self { ctx }
    }

    /// Delete properties then nodes for `path` and its descendants, returns
    /// the number of node rows removed
    pub async fn delete(
        &self,
        tx: &mut SyncTransaction,
        path: &str,
    ) -> Result<u64, SyncError> {
        tx.ensure_open().await?;
        let started = Instant::now();
        let removed = self.ctx.nodes.delete_subtree(tx.conn(), path).await?;
        self.ctx.metrics.record("persist.delete", started.elapsed());
        self.ctx.metrics.increment(Counter::NodesDeleted, removed);
        self.ctx
            .cache
            .evict_subtree(&NodeKey::from_source_path(path));

        tracing::debug!("Deleted {} rows at and below {}", removed, path);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseService, MirrorTable};
    use crate::tree::{ContentTree, InMemoryTree, PropertyValue, TreeProperty};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup() -> (TempDir, DatabaseService, InMemoryTree, VisitContext) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new_local(temp_dir.path().join("mirror.db"))
            .await
            .unwrap();
        let tree = InMemoryTree::new();
        tree.insert_node("/content", "sling:Folder", None, vec![]).unwrap();
        tree.insert_node(
            "/content/a",
            "cq:Page",
            None,
            vec![
                TreeProperty::single("one", PropertyValue::String("1".into())),
                TreeProperty::single("two", PropertyValue::Long(2)),
                TreeProperty::single("three", PropertyValue::Boolean(true)),
            ],
        )
        .unwrap();
        let ctx = VisitContext::new(
            Arc::new(PathIdCache::new(Uuid::new_v4())),
            Arc::new(SyncMetrics::new()),
        );
        (temp_dir, db, tree, ctx)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_temp_dir, db, tree, ctx) = setup().await;
        let mut visitor = UpsertVisitor::new(ctx.clone());
        let node = tree.get_node("/content/a").await.unwrap().unwrap();

        let mut tx = db.begin().await.unwrap();
        visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        tx.commit().await.unwrap();
        let first = ctx
            .nodes
            .load(tx.conn(), &NodeKey::new("/content/a", ""))
            .await
            .unwrap()
            .unwrap();

        visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        tx.commit().await.unwrap();
        let second = ctx
            .nodes
            .load(tx.conn(), &NodeKey::new("/content/a", ""))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 1);
        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 3);
        assert_eq!(ctx.metrics.counter(Counter::NodesInserted), 1);
        assert_eq!(ctx.metrics.counter(Counter::NodesUpdated), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_removed_property() {
        let (_temp_dir, db, tree, ctx) = setup().await;
        let mut visitor = UpsertVisitor::new(ctx.clone());

        let mut tx = db.begin().await.unwrap();
        let node = tree.get_node("/content/a").await.unwrap().unwrap();
        visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        tx.commit().await.unwrap();

        tree.remove_property("/content/a", "two").unwrap();
        let node = tree.get_node("/content/a").await.unwrap().unwrap();
        visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_resolves_parent() {
        let (_temp_dir, db, tree, ctx) = setup().await;
        let mut visitor = UpsertVisitor::new(ctx.clone());

        let mut tx = db.begin().await.unwrap();
        for path in ["/content", "/content/a"] {
            let node = tree.get_node(path).await.unwrap().unwrap();
            visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        }
        tx.commit().await.unwrap();

        let root = ctx
            .nodes
            .load(tx.conn(), &NodeKey::new("/content", ""))
            .await
            .unwrap()
            .unwrap();
        let child = ctx
            .nodes
            .load(tx.conn(), &NodeKey::new("/content/a", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.parent_id, None);
        assert_eq!(child.parent_id, Some(root.id));
    }

    #[tokio::test]
    async fn test_delete_removes_rows_and_cache_entries() {
        let (_temp_dir, db, tree, ctx) = setup().await;
        let mut visitor = UpsertVisitor::new(ctx.clone());

        let mut tx = db.begin().await.unwrap();
        for path in ["/content", "/content/a"] {
            let node = tree.get_node(path).await.unwrap().unwrap();
            visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        }
        assert_eq!(ctx.cache.len(), 2);

        let removed = DeleteVisitor::new(ctx.clone())
            .delete(&mut tx, "/content/a")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(ctx.cache.len(), 1);
        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 0);
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_insert_holds_batches_until_commit() {
        let (_temp_dir, db, tree, ctx) = setup().await;
        let queue = Arc::new(
            BatchWriteQueue::start(&db, 2, 16, 100, ctx.metrics.clone())
                .await
                .unwrap(),
        );
        let mut visitor = ForceInsertVisitor::new(ctx.clone(), queue.clone());

        let mut tx = db.begin().await.unwrap();
        for path in ["/content", "/content/a"] {
            let node = tree.get_node(path).await.unwrap().unwrap();
            visitor.visit(&mut tx, node.as_ref()).await.unwrap();
        }
        // Only /content/a has properties
        assert_eq!(visitor.pending_batches(), 1);

        tx.commit().await.unwrap();
        visitor.after_commit().await.unwrap();

        assert_eq!(visitor.pending_batches(), 0);
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 2);
        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 3);
    }
}
