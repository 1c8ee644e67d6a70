//! Full Re-indexer
//!
//! Rebuilds the whole mirror from the source tree.
//!
//! ## Flow
//!
//! 1. Atomically record `Reindexing`; a busy or disabled store rejects the job
//! 2. Truncate `property` and `node` and commit. There is no way back from
//!    here: a failure later leaves a partial mirror until the next re-index.
//! 3. Start the batch writers
//! 4. Walk every include root with the force-insert visitor; property rows go
//!    to the writers after each main commit
//! 5. Shut the writers down, record `Operational` and log the performance
//!    report
//!
//! On failure the main transaction is rolled back and the error recorded.
//! Property rows the writers already committed stay.

use crate::config::SyncConfig;
use crate::db::{DatabaseService, NodePersister, SyncMetrics, SyncStateStore, SyncTransaction};
use crate::models::{StartOutcome, SyncState};
use crate::operations::{
    BatchWriteQueue, ForceInsertVisitor, PathIdCache, SyncError, TreeWalker, VisitContext,
    WalkStats, WorkerReport,
};
use crate::tree::ContentTree;
use crate::utils::paths::is_same_or_descendant;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Result of a re-index request
#[derive(Debug, Clone, PartialEq)]
pub enum ReindexOutcome {
    /// Another job is active or synchronization is disabled
    Rejected(SyncState),
    Completed(ReindexReport),
    /// The error was recorded in the state log
    Failed(String),
}

impl ReindexOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReindexOutcome::Completed(_))
    }
}

/// Answer to an operator trigger
#[derive(Debug)]
pub enum TriggerResult {
    /// The job owns the `Reindexing` state and runs in the background
    Accepted(JoinHandle<ReindexOutcome>),
    /// The job could not start; the current state is attached
    Locked(SyncState),
}

impl TriggerResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TriggerResult::Accepted(_))
    }
}

/// Counters of a completed re-index
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexReport {
    pub job_id: Uuid,
    /// Include roots present in the tree
    pub roots: usize,
    pub walk: WalkStats,
    pub properties: usize,
    pub failed_batches: usize,
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
    pub nodes_per_second: f64,
}

/// Truncates and rebuilds the mirror
#[derive(Clone)]
pub struct FullReindexer {
    db: DatabaseService,
    state: SyncStateStore,
    tree: Arc<dyn ContentTree>,
    config: Arc<SyncConfig>,
}

impl FullReindexer {
    pub fn new(db: DatabaseService, tree: Arc<dyn ContentTree>, config: Arc<SyncConfig>) -> Self {
        Self {
            state: SyncStateStore::new(db.clone()),
            db,
            tree,
            config,
        }
    }

    /// Re-index now and wait for the result
    pub async fn run(&self) -> ReindexOutcome {
        match self.acquire().await {
            Ok(None) => {}
            Ok(Some(state)) => return ReindexOutcome::Rejected(state),
            Err(e) => {
                tracing::error!("Re-index could not start: {}", e);
                return ReindexOutcome::Failed(e.to_string());
            }
        }
        self.execute().await
    }

    /// Take the `Reindexing` state, then run the job in the background
    pub async fn trigger(&self) -> Result<TriggerResult, SyncError> {
        if let Some(state) = self.acquire().await? {
            return Ok(TriggerResult::Locked(state));
        }
        let job = self.clone();
        Ok(TriggerResult::Accepted(tokio::spawn(async move {
            job.execute().await
        })))
    }

    /// `None` when the job now owns the state, else the blocking state
    async fn acquire(&self) -> Result<Option<SyncState>, SyncError> {
        match self.state.start_reindex().await? {
            StartOutcome::Started => Ok(None),
            StartOutcome::Busy(state) => {
                tracing::info!("Re-index rejected, a {} job is active", state);
                Ok(Some(state))
            }
            StartOutcome::Disabled => {
                tracing::info!("Re-index rejected, synchronization is disabled");
                Ok(Some(SyncState::Disabled))
            }
        }
    }

    async fn execute(&self) -> ReindexOutcome {
        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("reindex", job = %job_id);

        async {
            let metrics = Arc::new(SyncMetrics::new());
            match self.rebuild(job_id, &metrics).await {
                Ok(report) => {
                    if let Err(e) = self.state.finished().await {
                        tracing::error!("Could not record the finished re-index: {}", e);
                        return ReindexOutcome::Failed(e.to_string());
                    }
                    tracing::info!(
                        "Re-index finished: {} nodes, {} properties in {:.2}s ({:.2} nodes/s)",
                        report.walk.visited,
                        report.properties,
                        report.elapsed.as_secs_f64(),
                        report.nodes_per_second
                    );
                    tracing::info!("{}", metrics.generate_report());
                    if let Err(e) = self.db.checkpoint().await {
                        tracing::warn!("WAL checkpoint after re-index failed: {}", e);
                    }
                    ReindexOutcome::Completed(report)
                }
                Err(e) => {
                    tracing::error!("Re-index failed: {}", e);
                    if let Err(state_err) = self.state.finished_with_error(&e.to_string()).await {
                        tracing::error!("Could not record the failed re-index: {}", state_err);
                    }
                    ReindexOutcome::Failed(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn rebuild(
        &self,
        job_id: Uuid,
        metrics: &Arc<SyncMetrics>,
    ) -> Result<ReindexReport, SyncError> {
        let mut tx = self.db.begin().await?;
        if let Err(e) = NodePersister::new().truncate(tx.conn()).await {
            tx.rollback_quietly().await;
            return Err(e.into());
        }
        tx.commit().await?;
        tracing::info!("Mirror truncated");

        let queue = Arc::new(
            BatchWriteQueue::start(
                &self.db,
                self.config.worker_count,
                self.config.batch_queue_capacity,
                self.config.worker_commit_rows,
                metrics.clone(),
            )
            .await?,
        );

        let ctx = VisitContext::new(Arc::new(PathIdCache::new(job_id)), metrics.clone());
        let mut visitor = ForceInsertVisitor::new(ctx, queue.clone());
        let walked = self.walk_roots(&mut tx, &mut visitor, metrics).await;
        drop(visitor);
        if walked.is_err() {
            tx.rollback_quietly().await;
        }

        // Stop the writers on every path so no worker outlives the job
        let workers = match Arc::try_unwrap(queue) {
            Ok(queue) => queue.shutdown().await,
            Err(_) => Err(SyncError::queue_closed("batch queue is still shared")),
        };

        let (roots, walk) = walked?;
        let workers = workers?;
        tx.commit().await?;

        Ok(ReindexReport {
            job_id,
            roots,
            walk,
            properties: workers.iter().map(|w| w.rows).sum(),
            failed_batches: workers.iter().map(|w| w.failed_batches).sum(),
            workers,
            elapsed: metrics.elapsed(),
            nodes_per_second: metrics.nodes_per_second(),
        })
    }

    async fn walk_roots(
        &self,
        tx: &mut SyncTransaction,
        visitor: &mut ForceInsertVisitor,
        metrics: &Arc<SyncMetrics>,
    ) -> Result<(usize, WalkStats), SyncError> {
        let walker = TreeWalker::new(
            self.config.path_filter(),
            self.config.commit_threshold,
            metrics.clone(),
        );

        let mut roots = 0;
        let mut stats = WalkStats::default();
        for root in distinct_roots(&self.config.include_paths) {
            let Some(node) = self.tree.get_node(root).await? else {
                tracing::warn!("Include path {} does not exist, skipping", root);
                continue;
            };
            tracing::info!("Re-indexing {}", root);
            roots += 1;
            stats.merge(walker.walk(tx, node, visitor).await?);
        }
        Ok((roots, stats))
    }
}

/// Include paths that are not below another include path
fn distinct_roots(include: &[String]) -> Vec<&str> {
    let mut roots: Vec<&str> = Vec::new();
    for path in include {
        let covered = include
            .iter()
            .any(|other| other != path && is_same_or_descendant(path, other));
        if !covered && !roots.contains(&path.as_str()) {
            roots.push(path.as_str());
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MirrorTable;
    use crate::tree::InMemoryTree;
    use tempfile::TempDir;

    #[test]
    fn test_distinct_roots() {
        let include = vec![
            "/content/site".to_string(),
            "/content".to_string(),
            "/etc".to_string(),
            "/etc".to_string(),
            "/content2".to_string(),
        ];
        assert_eq!(distinct_roots(&include), vec!["/content", "/etc", "/content2"]);
    }

    fn tree() -> InMemoryTree {
        InMemoryTree::from_json_str(
            r#"{
                "path": "/content",
                "children": [
                    { "name": "a", "properties": { "x": "1", "y": [true, false] },
                      "children": [ { "name": "b", "properties": { "z": 3 } } ] },
                    { "name": "c" }
                ]
            }"#,
        )
        .unwrap()
    }

    async fn setup(config: SyncConfig) -> (TempDir, DatabaseService, FullReindexer) {
        let temp_dir = TempDir::new().unwrap();
        let db = DatabaseService::new_local(temp_dir.path().join("mirror.db"))
            .await
            .unwrap();
        let reindexer = FullReindexer::new(db.clone(), Arc::new(tree()), Arc::new(config));
        (temp_dir, db, reindexer)
    }

    #[tokio::test]
    async fn test_run_rebuilds_mirror() {
        let config = SyncConfig {
            commit_threshold: 2,
            worker_count: 2,
            ..SyncConfig::default()
        };
        let (_temp_dir, db, reindexer) = setup(config).await;

        let ReindexOutcome::Completed(report) = reindexer.run().await else {
            panic!("expected a completed re-index");
        };
        assert_eq!(report.roots, 1);
        assert_eq!(report.walk.visited, 4);
        assert_eq!(report.walk.intermediate_commits, 2);
        assert_eq!(report.properties, 4);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 4);
        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 4);

        // A second run replaces rather than duplicates
        assert!(reindexer.run().await.is_completed());
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 4);
        assert_eq!(db.count_rows(MirrorTable::Property).await.unwrap(), 4);

        let state = SyncStateStore::new(db.clone());
        assert!(!state.is_busy().await.unwrap());
        assert!(state.last_checkpoint().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_include_root_is_skipped() {
        let config = SyncConfig {
            include_paths: vec!["/content".to_string(), "/missing".to_string()],
            ..SyncConfig::default()
        };
        let (_temp_dir, db, reindexer) = setup(config).await;

        let ReindexOutcome::Completed(report) = reindexer.run().await else {
            panic!("expected a completed re-index");
        };
        assert_eq!(report.roots, 1);
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_trigger_while_busy_is_locked() {
        let (_temp_dir, db, reindexer) = setup(SyncConfig::default()).await;
        let state = SyncStateStore::new(db.clone());
        state.start_reindex().await.unwrap();

        let result = reindexer.trigger().await.unwrap();

        assert!(matches!(result, TriggerResult::Locked(SyncState::Reindexing)));
        assert_eq!(db.count_rows(MirrorTable::SynchState).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trigger_runs_in_background() {
        let (_temp_dir, db, reindexer) = setup(SyncConfig::default()).await;

        let TriggerResult::Accepted(job) = reindexer.trigger().await.unwrap() else {
            panic!("expected the trigger to be accepted");
        };
        // The state is taken before the trigger returns
        assert!(matches!(
            reindexer.trigger().await.unwrap(),
            TriggerResult::Locked(_)
        ));

        assert!(job.await.unwrap().is_completed());
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_run_while_disabled_is_rejected() {
        let (_temp_dir, db, reindexer) = setup(SyncConfig::default()).await;
        SyncStateStore::new(db.clone()).disable().await.unwrap();

        assert_eq!(
            reindexer.run().await,
            ReindexOutcome::Rejected(SyncState::Disabled)
        );
        assert_eq!(db.count_rows(MirrorTable::Node).await.unwrap(), 0);
    }
}
