//! Periodic Reconciler
//!
//! Scheduled job that applies the queued change notifications to the mirror.
//!
//! ## Run
//!
//! 1. Skip when another job is active or synchronization is disabled
//! 2. Skip with a warning until a re-index has completed; the last successful
//!    run's start time is the checkpoint
//! 3. Atomically record `PeriodicUpdate`
//! 4. Drain the queue and apply every tracked event: deletes remove the
//!    subtree, updates upsert the node
//! 5. Unless the queue is trusted, also upsert every tracked node modified
//!    since the checkpoint that the queue did not already cover
//! 6. Commit and record `Operational`; on failure roll back and record the
//!    error text
//!
//! ## Scheduling
//!
//! `spawn()` runs the job on a fixed interval in a background task. The
//! returned handle can request an immediate run and stops the task on
//! `shutdown()` or when dropped.

use crate::config::{PathFilter, SyncConfig};
use crate::db::{DatabaseService, SyncMetrics, SyncStateStore, SyncTransaction};
use crate::models::{ChangeOperation, StartOutcome};
use crate::operations::{
    ChangeBatch, ChangeQueue, DeleteVisitor, PathIdCache, SyncError, SyncVisitor, UpsertVisitor,
    VisitContext,
};
use crate::tree::{ContentTree, TreeError, TreeNode};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

/// Result of one reconciler run
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing was done; the reason is logged as well
    Skipped(String),
    Completed(ReconcileReport),
    /// The run was rolled back and the error recorded in the state log
    Failed(String),
}

impl ReconcileOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReconcileOutcome::Completed(_))
    }
}

/// What one completed run did
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub job_id: Uuid,
    pub checkpoint: DateTime<Utc>,
    /// Events taken from the queue
    pub drained: usize,
    /// Nodes upserted from queued updates
    pub updated: usize,
    /// Node rows removed by queued deletes
    pub deleted: u64,
    /// Events outside the tracked paths
    pub ignored: usize,
    /// Queued updates whose node no longer exists
    pub vanished: usize,
    /// Nodes upserted by the modified-since scan
    pub scanned: usize,
    /// Nodes skipped because they could not be read
    pub unreadable: usize,
    pub elapsed: Duration,
}

impl ReconcileReport {
    fn new(job_id: Uuid, checkpoint: DateTime<Utc>, drained: usize) -> Self {
        Self {
            job_id,
            checkpoint,
            drained,
            updated: 0,
            deleted: 0,
            ignored: 0,
            vanished: 0,
            scanned: 0,
            unreadable: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Applies queued changes on a schedule
#[derive(Clone)]
pub struct PeriodicReconciler {
    db: DatabaseService,
    state: SyncStateStore,
    tree: Arc<dyn ContentTree>,
    queue: Arc<ChangeQueue>,
    config: Arc<SyncConfig>,
}

impl PeriodicReconciler {
    pub fn new(
        db: DatabaseService,
        tree: Arc<dyn ContentTree>,
        queue: Arc<ChangeQueue>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            state: SyncStateStore::new(db.clone()),
            db,
            tree,
            queue,
            config,
        }
    }

    /// Run the job once
    pub async fn run_once(&self) -> ReconcileOutcome {
        let checkpoint = match self.acquire().await {
            Ok(Ok(checkpoint)) => checkpoint,
            Ok(Err(reason)) => return ReconcileOutcome::Skipped(reason),
            Err(e) => {
                tracing::error!("Periodic update could not start: {}", e);
                return ReconcileOutcome::Failed(e.to_string());
            }
        };

        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("periodic_update", job = %job_id);
        self.execute(job_id, checkpoint).instrument(span).await
    }

    /// Checkpoint of a freshly started run, or the reason to skip
    async fn acquire(&self) -> Result<Result<DateTime<Utc>, String>, SyncError> {
        // Cheap pre-check so idle ticks never take the write lock
        let current = self.state.current_state().await?;
        if current.is_busy() || current.is_disabled() {
            tracing::debug!("Already busy or disabled ({}), skipping this update", current);
            return Ok(Err(format!("state is {}", current)));
        }

        let Some(checkpoint) = self.state.last_checkpoint().await? else {
            tracing::warn!("Not going to perform periodic update until a re-index was completed");
            return Ok(Err("no completed re-index".to_string()));
        };

        match self.state.start_periodic_update(checkpoint).await? {
            StartOutcome::Started => Ok(Ok(checkpoint)),
            StartOutcome::Busy(state) => {
                tracing::debug!("Lost the race to a {} job, skipping", state);
                Ok(Err(format!("state is {}", state)))
            }
            StartOutcome::Disabled => Ok(Err("state is disabled".to_string())),
        }
    }

    async fn execute(&self, job_id: Uuid, checkpoint: DateTime<Utc>) -> ReconcileOutcome {
        let batch = self.queue.drain();
        tracing::info!("Periodic update of {} queued changes", batch.len());

        let metrics = Arc::new(SyncMetrics::new());
        match self.apply(job_id, checkpoint, &batch, &metrics).await {
            Ok(mut report) => {
                report.elapsed = metrics.elapsed();
                if let Err(e) = self.state.finished().await {
                    tracing::error!("Could not record the finished periodic update: {}", e);
                    return ReconcileOutcome::Failed(e.to_string());
                }
                tracing::info!(
                    "Periodic update finished: {} updated, {} deleted, {} scanned in {:.2}s",
                    report.updated,
                    report.deleted,
                    report.scanned,
                    report.elapsed.as_secs_f64()
                );
                ReconcileOutcome::Completed(report)
            }
            Err(e) => {
                tracing::error!("Periodic update failed: {}", e);
                if let Err(state_err) = self.state.finished_with_error(&e.to_string()).await {
                    tracing::error!("Could not record the failed periodic update: {}", state_err);
                }
                ReconcileOutcome::Failed(e.to_string())
            }
        }
    }

    async fn apply(
        &self,
        job_id: Uuid,
        checkpoint: DateTime<Utc>,
        batch: &ChangeBatch,
        metrics: &Arc<SyncMetrics>,
    ) -> Result<ReconcileReport, SyncError> {
        let ctx = VisitContext::new(Arc::new(PathIdCache::new(job_id)), metrics.clone());
        let mut upsert = UpsertVisitor::new(ctx.clone());
        let deleter = DeleteVisitor::new(ctx);
        let filter = self.config.path_filter();
        let mut report = ReconcileReport::new(job_id, checkpoint, batch.len());

        let mut tx = self.db.begin().await?;
        let applied = self
            .apply_in(&mut tx, &filter, batch, &mut upsert, &deleter, &mut report)
            .await;

        match applied {
            Ok(()) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(e) => {
                tx.rollback_quietly().await;
                Err(e)
            }
        }
    }

    async fn apply_in(
        &self,
        tx: &mut SyncTransaction,
        filter: &PathFilter,
        batch: &ChangeBatch,
        upsert: &mut UpsertVisitor,
        deleter: &DeleteVisitor,
        report: &mut ReconcileReport,
    ) -> Result<(), SyncError> {
        for event in batch.events() {
            if !filter.should_update(&event.path) {
                tracing::debug!("`{}` is not a tracked path, skipping", event.path);
                report.ignored += 1;
                continue;
            }

            match event.operation {
                ChangeOperation::Delete => {
                    report.deleted += deleter.delete(tx, &event.path).await?;
                }
                ChangeOperation::Update => match self.tree.get_node(&event.path).await? {
                    Some(node) => {
                        if upsert_node(tx, upsert, node.as_ref()).await? {
                            report.updated += 1;
                        } else {
                            report.unreadable += 1;
                        }
                    }
                    None => {
                        tracing::warn!("{}", SyncError::vanished(&event.path));
                        report.vanished += 1;
                    }
                },
            }
        }

        if !self.config.trust_queue {
            let modified = self.tree.nodes_modified_since(report.checkpoint).await?;
            for node in modified {
                let path = node.path();
                if !filter.should_update(path) {
                    continue;
                }
                if batch.has_update(path) {
                    tracing::debug!("{} was already synchronized from the queue", path);
                    continue;
                }
                tracing::info!("Periodic update for {}", path);
                if upsert_node(tx, upsert, node.as_ref()).await? {
                    report.scanned += 1;
                } else {
                    report.unreadable += 1;
                }
            }
        }

        Ok(())
    }

    /// Run the job every configured interval in a background task
    pub fn spawn(self) -> ReconcilerHandle {
        let interval = self.config.periodic_interval();
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tracing::info!(
            "Periodic reconciler scheduled every {}s",
            interval.as_secs()
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!("Periodic reconciler shutting down");
                        break;
                    }

                    Some(_) = trigger_rx.recv() => {
                        tracing::debug!("Periodic reconciler woken up by trigger");
                    }

                    _ = ticker.tick() => {}
                }

                self.run_once().await;
            }
        });

        ReconcilerHandle {
            trigger_tx,
            shutdown_tx,
            task,
        }
    }
}

/// Upsert one node; `false` when the node could not be read
async fn upsert_node(
    tx: &mut SyncTransaction,
    upsert: &mut UpsertVisitor,
    node: &dyn TreeNode,
) -> Result<bool, SyncError> {
    match upsert.visit(tx, node).await {
        Ok(()) => Ok(true),
        Err(SyncError::Tree(e @ TreeError::ReadFailed { .. })) => {
            tracing::warn!("Skipping {}: {}", node.path(), e);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Handle to a scheduled reconciler
///
/// Dropping the handle stops the background task after its current run.
pub struct ReconcilerHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Request a run without waiting for the next tick
    ///
    /// Non-blocking. Requests made while one is already pending are coalesced.
    pub fn wake(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(()) => tracing::debug!("Periodic reconciler wake signal sent"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Periodic reconciler already has a pending wake")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Periodic reconciler has shut down, wake ignored")
            }
        }
    }

    /// Stop the background task, waiting for a run in progress to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!("Periodic reconciler task failed: {}", e);
        }
    }
}
