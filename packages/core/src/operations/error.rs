//! Error types for synchronization jobs
//!
//! `SyncError` is the job-level taxonomy. A job that returns one of these
//! rolls back its own transaction and records the message in the state log.
//! A busy or disabled mirror is not an error: it is reported as
//! `StartOutcome::Busy` / `StartOutcome::Disabled` by the state store.

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::tree::TreeError;
use thiserror::Error;

/// Errors that abort a synchronization job
///
/// # Examples
///
/// ```rust
/// use treemirror_core::operations::SyncError;
///
/// let err = SyncError::vanished("/content/site/old-page");
/// assert!(err.to_string().contains("/content/site/old-page"));
/// ```
#[derive(Error, Debug)]
pub enum SyncError {
    /// The source tree or the database cannot be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A write failed in the middle of a job
    #[error("Persistence error: {0}")]
    Persistence(#[source] DatabaseError),

    /// A queued path no longer exists in the source tree
    #[error("Resource `{path}` no longer exists")]
    VanishedResource { path: String },

    /// The source tree could not be read
    #[error("Content tree error: {0}")]
    Tree(#[from] TreeError),

    /// The engine configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// One batch worker failed to write a batch
    ///
    /// Only ever logged; the worker continues with its next batch.
    #[error("Worker {worker} failed to write a batch: {source}")]
    WorkerWrite {
        worker: usize,
        #[source]
        source: DatabaseError,
    },

    /// The batch queue was used after shutdown or a worker died
    #[error("Batch write queue closed: {0}")]
    QueueClosed(String),
}

impl SyncError {
    pub fn vanished(path: impl Into<String>) -> Self {
        Self::VanishedResource { path: path.into() }
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn queue_closed(msg: impl Into<String>) -> Self {
        Self::QueueClosed(msg.into())
    }

    pub fn worker_write(worker: usize, source: DatabaseError) -> Self {
        Self::WorkerWrite { worker, source }
    }
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        if err.is_connectivity() {
            SyncError::Connectivity(err.to_string())
        } else {
            SyncError::Persistence(err)
        }
    }
}
