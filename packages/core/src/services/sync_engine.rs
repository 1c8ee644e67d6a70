//! Sync Engine
//!
//! Owns the configuration, database, source tree and change queue, and hands
//! out the three jobs built on them. Also carries the operator surface:
//! trigger a re-index, reset, disable and enable the state log, inspect the
//! status, and synchronize or delete one path right away.

use crate::config::SyncConfig;
use crate::db::{DatabaseError, DatabaseService, MirrorTable, SyncMetrics, SyncStateStore};
use crate::models::{StartOutcome, SyncState, SyncStateRecord};
use crate::operations::{
    ChangeQueue, DeleteVisitor, PathIdCache, SyncError, TreeWalker, UpsertVisitor, VisitContext,
    WalkStats,
};
use crate::services::{
    FullReindexer, InstantSynchronizer, PeriodicReconciler, ReconcilerHandle, TriggerResult,
};
use crate::tree::ContentTree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// Snapshot of the engine for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub busy: bool,
    pub latest: Option<SyncStateRecord>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    /// Operations waiting in the change queue
    pub queued: usize,
    pub nodes: i64,
    pub properties: i64,
}

/// Result of a direct single-path operation
#[derive(Debug, Clone, PartialEq)]
pub enum DirectOutcome {
    /// The path is not tracked
    Ignored,
    /// Another job is active or synchronization is disabled
    Rejected(SyncState),
    /// The path no longer exists in the tree; nothing was written
    Vanished,
    Synchronized(WalkStats),
    /// Node rows removed at and below the path
    Deleted(u64),
    /// The error was recorded in the state log
    Failed(String),
}

/// Entry point owning everything the jobs share
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    db: DatabaseService,
    state: SyncStateStore,
    tree: Arc<dyn ContentTree>,
    queue: Arc<ChangeQueue>,
}

impl SyncEngine {
    /// Validate `config`, connect and initialize the mirror schema
    pub async fn new(config: SyncConfig, tree: Arc<dyn ContentTree>) -> Result<Self, SyncError> {
        config.validate()?;
        let db = DatabaseService::new(&config.connection, config.busy_timeout_ms).await?;
        Self::with_database(config, db, tree)
    }

    /// Use an already initialized database
    pub fn with_database(
        config: SyncConfig,
        db: DatabaseService,
        tree: Arc<dyn ContentTree>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            state: SyncStateStore::new(db.clone()),
            db,
            tree,
            queue: Arc::new(ChangeQueue::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub fn state_store(&self) -> &SyncStateStore {
        &self.state
    }

    pub fn queue(&self) -> &Arc<ChangeQueue> {
        &self.queue
    }

    pub fn instant(&self) -> InstantSynchronizer {
        InstantSynchronizer::new(self.queue.clone(), self.config.instant_enabled)
    }

    pub fn reconciler(&self) -> PeriodicReconciler {
        PeriodicReconciler::new(
            self.db.clone(),
            self.tree.clone(),
            self.queue.clone(),
            self.config.clone(),
        )
    }

    pub fn reindexer(&self) -> FullReindexer {
        FullReindexer::new(self.db.clone(), self.tree.clone(), self.config.clone())
    }

    /// Schedule the reconciler, `None` when periodic updates are disabled
    pub fn start_periodic(&self) -> Option<ReconcilerHandle> {
        if !self.config.periodic_enabled {
            tracing::info!("The periodic scheduler is disabled");
            return None;
        }
        Some(self.reconciler().spawn())
    }

    pub async fn trigger_reindex(&self) -> Result<TriggerResult, SyncError> {
        self.reindexer().trigger().await
    }

    /// Clear the state log, returns the number of records removed
    pub async fn reset_state(&self) -> Result<u64, SyncError> {
        let removed = self.state.reset().await?;
        tracing::info!("State log reset, {} records removed", removed);
        Ok(removed)
    }

    pub async fn disable(&self) -> Result<(), SyncError> {
        self.state.disable().await?;
        tracing::info!("Synchronization disabled");
        Ok(())
    }

    pub async fn enable(&self) -> Result<(), SyncError> {
        self.state.enable().await?;
        tracing::info!("Synchronization enabled");
        Ok(())
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let latest = self.state.latest().await?;
        let state = latest
            .as_ref()
            .map(|record| record.state)
            .unwrap_or(SyncState::Operational);
        Ok(SyncStatus {
            state,
            busy: state.is_busy(),
            latest,
            last_checkpoint: self.state.last_checkpoint().await?,
            queued: self.queue.len(),
            nodes: self.db.count_rows(MirrorTable::Node).await?,
            properties: self.db.count_rows(MirrorTable::Property).await?,
        })
    }

    /// Most recent state records, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SyncStateRecord>, SyncError> {
        Ok(self.state.history(limit).await?)
    }

    /// Upsert the subtree at `path` immediately, bypassing the queue
    pub async fn synchronize_now(&self, path: &str) -> DirectOutcome {
        if !self.config.path_filter().should_update(path) {
            tracing::debug!("`{}` is not a tracked path, skipping", path);
            return DirectOutcome::Ignored;
        }
        if let Some(outcome) = rejection(self.state.start_update(path).await) {
            return outcome;
        }

        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("direct_update", job = %job_id, path = %path);
        let result = self.upsert_subtree(job_id, path).instrument(span).await;
        self.finish(result).await
    }

    /// Remove `path` and everything below it immediately, bypassing the queue
    pub async fn delete_now(&self, path: &str) -> DirectOutcome {
        if !self.config.path_filter().should_update(path) {
            tracing::debug!("`{}` is not a tracked path, skipping", path);
            return DirectOutcome::Ignored;
        }
        if let Some(outcome) = rejection(self.state.start_delete(path).await) {
            return outcome;
        }

        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("direct_delete", job = %job_id, path = %path);
        let result = self.delete_subtree(job_id, path).instrument(span).await;
        self.finish(result).await
    }

    async fn finish(&self, result: Result<DirectOutcome, SyncError>) -> DirectOutcome {
        match result {
            Ok(outcome) => match self.state.finished().await {
                Ok(()) => outcome,
                Err(e) => {
                    tracing::error!("Could not record the finished job: {}", e);
                    DirectOutcome::Failed(e.to_string())
                }
            },
            Err(e) => {
                tracing::error!("Direct synchronization failed: {}", e);
                if let Err(state_err) = self.state.finished_with_error(&e.to_string()).await {
                    tracing::error!("Could not record the failed job: {}", state_err);
                }
                DirectOutcome::Failed(e.to_string())
            }
        }
    }

    async fn upsert_subtree(&self, job_id: Uuid, path: &str) -> Result<DirectOutcome, SyncError> {
        let Some(node) = self.tree.get_node(path).await? else {
            tracing::warn!("{}", SyncError::vanished(path));
            return Ok(DirectOutcome::Vanished);
        };

        let metrics = Arc::new(SyncMetrics::new());
        let ctx = VisitContext::new(Arc::new(PathIdCache::new(job_id)), metrics.clone());
        let mut visitor = UpsertVisitor::new(ctx);
        let walker = TreeWalker::new(
            self.config.path_filter(),
            self.config.commit_threshold,
            metrics,
        );

        let mut tx = self.db.begin().await?;
        match walker.walk(&mut tx, node, &mut visitor).await {
            Ok(stats) => {
                tracing::info!("Synchronized {} nodes below {}", stats.visited, path);
                Ok(DirectOutcome::Synchronized(stats))
            }
            Err(e) => {
                tx.rollback_quietly().await;
                Err(e)
            }
        }
    }

    async fn delete_subtree(&self, job_id: Uuid, path: &str) -> Result<DirectOutcome, SyncError> {
        let metrics = Arc::new(SyncMetrics::new());
        let deleter = DeleteVisitor::new(VisitContext::new(
            Arc::new(PathIdCache::new(job_id)),
            metrics,
        ));

        let mut tx = self.db.begin().await?;
        match deleter.delete(&mut tx, path).await {
            Ok(removed) => {
                tx.commit().await?;
                tracing::info!("Deleted {} nodes at and below {}", removed, path);
                Ok(DirectOutcome::Deleted(removed))
            }
            Err(e) => {
                tx.rollback_quietly().await;
                Err(e)
            }
        }
    }
}

/// `None` when the caller owns the job, else the outcome to return
fn rejection(started: Result<StartOutcome, DatabaseError>) -> Option<DirectOutcome> {
    match started {
        Ok(StartOutcome::Started) => None,
        Ok(StartOutcome::Busy(state)) => {
            tracing::info!("Already busy ({}), skipping", state);
            Some(DirectOutcome::Rejected(state))
        }
        Ok(StartOutcome::Disabled) => {
            tracing::info!("Synchronization is disabled, skipping");
            Some(DirectOutcome::Rejected(SyncState::Disabled))
        }
        Err(e) => {
            tracing::error!("Could not start: {}", e);
            Some(DirectOutcome::Failed(e.to_string()))
        }
    }
}
