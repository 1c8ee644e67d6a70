//! Batch Write Queue
//!
//! Producer/consumer pipeline that decouples a full re-index traversal from
//! the database write throughput of property rows.
//!
//! ## Model
//!
//! 1. One producer (the traversal) submits one `PropertyBatch` per node into a
//!    bounded MPMC channel; `submit()` waits while the channel is full
//! 2. K workers, each with its own connection, take batches and write them
//!    with one multi-row insert inside the worker's own transaction
//! 3. A worker commits when the channel is momentarily empty or when enough
//!    rows are pending
//! 4. `commit()` waits until every submitted batch has been processed, then
//!    tells each worker to commit and waits for the acknowledgements
//! 5. `shutdown()` commits, closes the channel and joins the workers
//!
//! Each batch runs inside its own savepoint. A worker that fails to write a
//! batch logs the error, rolls back to that savepoint and carries on with the
//! next batch; earlier batches in the same transaction are kept. Failures
//! never reach the producer or the other workers.
//!
//! Rows are counted when the transaction that holds them commits.

use crate::db::{
    Counter, DatabaseError, DatabaseService, PropertyPersister, SyncMetrics, SyncTransaction,
};
use crate::models::PropertyBatch;
use crate::operations::SyncError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Control messages handled by a worker between batches
enum WorkerControl {
    /// Commit the open transaction and acknowledge
    Commit(oneshot::Sender<Result<(), String>>),
}

/// What one worker did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub batches: usize,
    pub rows: usize,
    pub failed_batches: usize,
    pub commits: usize,
}

/// Number of submitted batches not yet processed by a worker
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Bounded queue of property batches served by a fixed worker pool
pub struct BatchWriteQueue {
    sender: async_channel::Sender<PropertyBatch>,
    controls: Vec<mpsc::Sender<WorkerControl>>,
    handles: Vec<JoinHandle<WorkerReport>>,
    in_flight: Arc<InFlight>,
    metrics: Arc<SyncMetrics>,
}

impl BatchWriteQueue {
    /// Open one connection per worker and spawn the workers
    ///
    /// # Errors
    ///
    /// Fails when a worker connection cannot be opened; no worker is left
    /// running in that case.
    pub async fn start(
        db: &DatabaseService,
        worker_count: usize,
        capacity: usize,
        worker_commit_rows: usize,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, SyncError> {
        let worker_count = worker_count.max(1);

        let mut connections = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            connections.push(db.connect_with_timeout().await?);
        }

        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let in_flight = Arc::new(InFlight::default());

        let mut controls = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for (id, conn) in connections.into_iter().enumerate() {
            let (control_tx, control_rx) = mpsc::channel(1);
            let worker = Worker {
                id,
                tx: SyncTransaction::idle(conn),
                receiver: receiver.clone(),
                controls: control_rx,
                in_flight: in_flight.clone(),
                metrics: metrics.clone(),
                persister: PropertyPersister::new(),
                commit_rows: worker_commit_rows.max(1),
                rows_pending: 0,
                report: WorkerReport {
                    worker: id,
                    ..WorkerReport::default()
                },
            };
            let span = tracing::info_span!("batch_worker", worker = id);
            handles.push(tokio::spawn(worker.run().instrument(span)));
            controls.push(control_tx);
        }

        tracing::debug!(
            "Started {} batch workers (queue capacity {})",
            worker_count,
            capacity
        );

        Ok(Self {
            sender,
            controls,
            handles,
            in_flight,
            metrics,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Hand a batch to the workers, waiting while the queue is full
    pub async fn submit(&self, batch: PropertyBatch) -> Result<(), SyncError> {
        self.in_flight.add();
        if let Err(e) = self.sender.send(batch).await {
            self.in_flight.done();
            return Err(SyncError::queue_closed(format!(
                "cannot submit batch for {}",
                e.into_inner().owner
            )));
        }
        self.metrics.increment(Counter::BatchesSubmitted, 1);
        Ok(())
    }

    /// Batches submitted but not yet processed
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until all submitted batches are processed, then make every
    /// worker commit
    ///
    /// Worker commit failures are logged by the worker and counted here; they
    /// do not fail the caller.
    pub async fn commit(&self) -> Result<usize, SyncError> {
        self.in_flight.wait_idle().await;

        let mut acks = Vec::with_capacity(self.controls.len());
        for (id, control) in self.controls.iter().enumerate() {
            let (ack_tx, ack_rx) = oneshot::channel();
            control
                .send(WorkerControl::Commit(ack_tx))
                .await
                .map_err(|_| SyncError::queue_closed(format!("worker {} has stopped", id)))?;
            acks.push((id, ack_rx));
        }

        let mut failed = 0;
        for (id, ack) in acks {
            match ack.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Worker {} could not commit: {}", id, e);
                    failed += 1;
                }
                Err(_) => {
                    return Err(SyncError::queue_closed(format!(
                        "worker {} stopped before acknowledging commit",
                        id
                    )))
                }
            }
        }
        Ok(failed)
    }

    /// Commit, close the queue and wait for every worker to exit
    pub async fn shutdown(self) -> Result<Vec<WorkerReport>, SyncError> {
        self.commit().await?;
        self.sender.close();
        drop(self.controls);

        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let report = handle
                .await
                .map_err(|e| SyncError::queue_closed(format!("worker task failed: {}", e)))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

enum WorkerEvent {
    Control(WorkerControl),
    Batch(Option<PropertyBatch>),
}

struct Worker {
    id: usize,
    tx: SyncTransaction,
    receiver: async_channel::Receiver<PropertyBatch>,
    controls: mpsc::Receiver<WorkerControl>,
    in_flight: Arc<InFlight>,
    metrics: Arc<SyncMetrics>,
    persister: PropertyPersister,
    commit_rows: usize,
    rows_pending: usize,
    report: WorkerReport,
}

impl Worker {
    async fn run(mut self) -> WorkerReport {
        loop {
            let event = tokio::select! {
                biased; // Control messages first

                Some(control) = self.controls.recv() => WorkerEvent::Control(control),
                batch = self.receiver.recv() => WorkerEvent::Batch(batch.ok()),
            };

            match event {
                WorkerEvent::Control(WorkerControl::Commit(ack)) => {
                    let result = self.commit().await.map_err(|e| e.to_string());
                    let _ = ack.send(result);
                }
                WorkerEvent::Batch(Some(batch)) => {
                    self.process(batch).await;
                    self.in_flight.done();
                }
                // Closed and empty
                WorkerEvent::Batch(None) => break,
            }
        }

        if let Err(e) = self.commit().await {
            tracing::error!("Worker {} failed final commit: {}", self.id, e);
        }
        tracing::debug!(
            "Worker {} finished: {} batches, {} rows, {} failed",
            self.id,
            self.report.batches,
            self.report.rows,
            self.report.failed_batches
        );
        self.report
    }

    async fn process(&mut self, batch: PropertyBatch) {
        let started = Instant::now();
        self.report.batches += 1;

        match self.write(&batch).await {
            Ok(rows) => self.rows_pending += rows,
            Err(e) => {
                let err = SyncError::worker_write(self.id, e);
                tracing::error!("{} (node {})", err, batch.owner);
                self.report.failed_batches += 1;
                self.metrics.increment(Counter::BatchesFailed, 1);
            }
        }

        if self.rows_pending >= self.commit_rows || self.receiver.is_empty() {
            if let Err(e) = self.commit().await {
                tracing::error!("{}", SyncError::worker_write(self.id, e));
                self.metrics.increment(Counter::BatchesFailed, 1);
            }
        }

        self.metrics
            .record(&format!("worker-{}", self.id), started.elapsed());
    }

    /// Write one batch inside a savepoint of the worker's transaction
    async fn write(&mut self, batch: &PropertyBatch) -> Result<usize, DatabaseError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.tx.ensure_open().await?;
        self.tx
            .conn()
            .execute("SAVEPOINT property_batch", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to open savepoint: {}", e))
            })?;

        match self.persister.insert_batch(self.tx.conn(), batch).await {
            Ok(rows) => {
                self.release_savepoint().await?;
                Ok(rows)
            }
            Err(e) => {
                self.undo_batch().await;
                Err(e)
            }
        }
    }

    async fn release_savepoint(&mut self) -> Result<(), DatabaseError> {
        self.tx
            .conn()
            .execute("RELEASE SAVEPOINT property_batch", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to release savepoint: {}", e))
            })?;
        Ok(())
    }

    /// Undo the rows of the failed batch only
    ///
    /// Falls back to rolling back the whole transaction when the savepoint
    /// cannot be restored; the uncommitted rows of earlier batches are then
    /// lost and logged as such.
    async fn undo_batch(&mut self) {
        let restored = self
            .tx
            .conn()
            .execute("ROLLBACK TO SAVEPOINT property_batch", ())
            .await;
        let released = match restored {
            Ok(_) => self.release_savepoint().await,
            Err(e) => Err(DatabaseError::sql_execution(format!(
                "Failed to roll back to savepoint: {}",
                e
            ))),
        };

        if let Err(e) = released {
            tracing::error!(
                "Worker {} discarding {} uncommitted rows: {}",
                self.id,
                self.rows_pending,
                e
            );
            self.tx.rollback_quietly().await;
            self.rows_pending = 0;
        }
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        if !self.tx.is_open() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows_pending);
        if let Err(e) = self.tx.commit().await {
            tracing::error!(
                "Worker {} lost {} uncommitted rows in a failed commit",
                self.id,
                rows
            );
            return Err(e);
        }
        self.report.commits += 1;
        self.report.rows += rows;
        self.metrics
            .increment(Counter::PropertiesWritten, rows as u64);
        Ok(())
    }
}
