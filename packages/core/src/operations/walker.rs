//! Tree Walker
//!
//! Depth-first, pre-order traversal of a source subtree with an explicit
//! stack. Children are visited in source order. The traversal itself never
//! runs in parallel; the source tree is not assumed safe for parallel reads.
//!
//! ## Commit cadence
//!
//! After every `commit_threshold` visits the transaction is committed, the
//! visitor's `after_commit()` runs, and a new transaction is started. One
//! final commit always happens at the end of the walk, followed by a last
//! `after_commit()`.
//!
//! ## Failures
//!
//! - An excluded path is skipped together with its whole subtree
//! - A node whose children or properties cannot be read is logged and its
//!   subtree skipped
//! - Any persistence failure aborts the walk

use crate::config::PathFilter;
use crate::db::{Counter, SyncMetrics, SyncTransaction};
use crate::operations::visitor::SyncVisitor;
use crate::operations::SyncError;
use crate::tree::{TreeError, TreeNode};
use crate::utils::paths::progress_prefix;
use std::sync::Arc;

/// Counts of one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub visited: usize,
    pub skipped: usize,
    pub intermediate_commits: usize,
    pub final_commits: usize,
}

impl WalkStats {
    pub fn merge(&mut self, other: WalkStats) {
        self.visited += other.visited;
        self.skipped += other.skipped;
        self.intermediate_commits += other.intermediate_commits;
        self.final_commits += other.final_commits;
    }
}

/// Filtered subtree traversal with bounded transactions
#[derive(Debug, Clone)]
pub struct TreeWalker {
    filter: PathFilter,
    commit_threshold: usize,
    metrics: Arc<SyncMetrics>,
}

impl TreeWalker {
    pub fn new(filter: PathFilter, commit_threshold: usize, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            filter,
            commit_threshold: commit_threshold.max(1),
            metrics,
        }
    }

    /// Visit `root` and its descendants with `visitor` inside `tx`
    pub async fn walk(
        &self,
        tx: &mut SyncTransaction,
        root: Arc<dyn TreeNode>,
        visitor: &mut dyn SyncVisitor,
    ) -> Result<WalkStats, SyncError> {
        let mut stats = WalkStats::default();
        let mut stack: Vec<Arc<dyn TreeNode>> = vec![root];
        let mut last_prefix: Option<String> = None;

        tx.ensure_open().await?;

        while let Some(node) = stack.pop() {
            let path = node.path().to_string();

            if self.filter.is_excluded(&path) {
                tracing::debug!("Skipping excluded subtree {}", path);
                stats.skipped += 1;
                continue;
            }

            let prefix = progress_prefix(&path);
            if last_prefix.as_deref() != Some(prefix) {
                tracing::info!("Synchronizing {}", prefix);
                last_prefix = Some(prefix.to_string());
            }

            match visitor.visit(tx, node.as_ref()).await {
                Ok(()) => {}
                Err(SyncError::Tree(e @ TreeError::ReadFailed { .. })) => {
                    tracing::warn!("Skipping subtree {}: {}", path, e);
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            stats.visited += 1;
            self.metrics.increment(Counter::NodesVisited, 1);

            if stats.visited % self.commit_threshold == 0 {
                tx.commit().await?;
                visitor.after_commit().await?;
                tx.ensure_open().await?;
                stats.intermediate_commits += 1;
                self.metrics.increment(Counter::Commits, 1);
                tracing::debug!("Committed after {} nodes", stats.visited);
            }

            match node.children().await {
                Ok(children) => stack.extend(children.into_iter().rev()),
                Err(e) => {
                    tracing::warn!("Cannot read children of {}, skipping them: {}", path, e);
                    stats.skipped += 1;
                }
            }
        }

        tx.commit().await?;
        visitor.after_commit().await?;
        stats.final_commits += 1;
        self.metrics.increment(Counter::Commits, 1);

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use crate::tree::{ContentTree, InMemoryTree};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Records visit order and commit callbacks without touching the database
    #[derive(Default)]
    struct RecordingVisitor {
        visited: Vec<String>,
        after_commits: usize,
    }

    #[async_trait]
    impl SyncVisitor for RecordingVisitor {
        async fn visit(
            &mut self,
            _tx: &mut SyncTransaction,
            node: &dyn TreeNode,
        ) -> Result<(), SyncError> {
            self.visited.push(node.path().to_string());
            Ok(())
        }

        async fn after_commit(&mut self) -> Result<(), SyncError> {
            self.after_commits += 1;
            Ok(())
        }
    }

    fn tree() -> InMemoryTree {
        InMemoryTree::from_json_str(
            r#"{
                "path": "/content",
                "children": [
                    { "name": "a", "children": [ { "name": "b" }, { "name": "c" } ] },
                    { "name": "x", "children": [ { "name": "y" } ] },
                    { "name": "d" }
                ]
            }"#,
        )
        .unwrap()
    }

    async fn setup() -> (TempDir, DatabaseService) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new_local(temp_dir.path().join("mirror.db"))
            .await
            .unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_preorder_in_source_order_with_exclusion() {
        let (_temp_dir, db) = setup().await;
        let tree = tree();
        let walker = TreeWalker::new(
            PathFilter::new(["/content"], ["/content/x"]),
            100,
            Arc::new(SyncMetrics::new()),
        );
        let mut visitor = RecordingVisitor::default();
        let mut tx = db.begin().await.unwrap();

        let root = tree.get_node("/content").await.unwrap().unwrap();
        let stats = walker.walk(&mut tx, root, &mut visitor).await.unwrap();

        assert_eq!(
            visitor.visited,
            vec![
                "/content",
                "/content/a",
                "/content/a/b",
                "/content/a/c",
                "/content/d"
            ]
        );
        assert_eq!(stats.visited, 5);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_commit_cadence() {
        let (_temp_dir, db) = setup().await;
        let tree = tree();
        let metrics = Arc::new(SyncMetrics::new());
        let walker = TreeWalker::new(
            PathFilter::new(["/content"], Vec::<String>::new()),
            3,
            metrics.clone(),
        );
        let mut visitor = RecordingVisitor::default();
        let mut tx = db.begin().await.unwrap();

        let root = tree.get_node("/content").await.unwrap().unwrap();
        let stats = walker.walk(&mut tx, root, &mut visitor).await.unwrap();

        // 7 nodes, threshold 3: two intermediate commits plus the final one
        assert_eq!(stats.visited, 7);
        assert_eq!(stats.intermediate_commits, 2);
        assert_eq!(stats.final_commits, 1);
        assert_eq!(visitor.after_commits, 3);
        assert_eq!(tx.commits(), 3);
        assert!(!tx.is_open());
        assert_eq!(metrics.counter(Counter::Commits), 3);
    }

    #[tokio::test]
    async fn test_exact_multiple_still_commits_once_more() {
        let (_temp_dir, db) = setup().await;
        let tree = tree();
        let walker = TreeWalker::new(
            PathFilter::new(["/content"], Vec::<String>::new()),
            7,
            Arc::new(SyncMetrics::new()),
        );
        let mut visitor = RecordingVisitor::default();
        let mut tx = db.begin().await.unwrap();

        let root = tree.get_node("/content").await.unwrap().unwrap();
        let stats = walker.walk(&mut tx, root, &mut visitor).await.unwrap();

        assert_eq!(stats.intermediate_commits, 1);
        assert_eq!(stats.final_commits, 1);
    }

    #[tokio::test]
    async fn test_unreadable_children_are_skipped() {
        let (_temp_dir, db) = setup().await;
        let tree = tree();
        tree.set_unreadable("/content/a", true).unwrap();
        let walker = TreeWalker::new(
            PathFilter::new(["/content"], Vec::<String>::new()),
            100,
            Arc::new(SyncMetrics::new()),
        );
        let mut visitor = RecordingVisitor::default();
        let mut tx = db.begin().await.unwrap();

        let root = tree.get_node("/content").await.unwrap().unwrap();
        let stats = walker.walk(&mut tx, root, &mut visitor).await.unwrap();

        assert_eq!(
            visitor.visited,
            vec!["/content", "/content/a", "/content/x", "/content/x/y", "/content/d"]
        );
        assert_eq!(stats.skipped, 1);
    }
}
