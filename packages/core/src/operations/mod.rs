//! Synchronization Operations
//!
//! The building blocks the jobs in `services` are assembled from:
//!
//! - `ChangeQueue` - pending path operations from change notifications
//! - `PathIdCache` - per-job `(path, sub) -> id` memo
//! - `NodeTransform` - tree node to mirror rows
//! - Visitors - upsert, force-insert and delete strategies
//! - `TreeWalker` - filtered traversal with bounded transactions
//! - `BatchWriteQueue` - parallel property writers for the full re-index

pub mod batch_writer;
pub mod change_queue;
mod error;
pub mod path_cache;
pub mod transform;
pub mod visitor;
pub mod walker;

pub use batch_writer::{BatchWriteQueue, WorkerReport};
pub use change_queue::{ChangeBatch, ChangeQueue};
pub use error::SyncError;
pub use path_cache::PathIdCache;
pub use transform::NodeTransform;
pub use visitor::{DeleteVisitor, ForceInsertVisitor, SyncVisitor, UpsertVisitor, VisitContext};
pub use walker::{TreeWalker, WalkStats};
