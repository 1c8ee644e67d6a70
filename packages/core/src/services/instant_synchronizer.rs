//! Instant Synchronizer
//!
//! Entry point for change notifications. Calls only record the path in the
//! shared `ChangeQueue` and return; the database is written when the periodic
//! reconciler next drains the queue, so notification callers never wait on
//! database I/O.

use crate::operations::ChangeQueue;
use std::sync::Arc;

/// Cloneable handle that turns change notifications into queued events
#[derive(Debug, Clone)]
pub struct InstantSynchronizer {
    queue: Arc<ChangeQueue>,
    enabled: bool,
}

impl InstantSynchronizer {
    pub fn new(queue: Arc<ChangeQueue>, enabled: bool) -> Self {
        Self { queue, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record that the node at `path` was added or changed
    pub fn synch(&self, path: &str) {
        if !self.enabled {
            tracing::info!("Instant synchronization not enabled, ignoring {}", path);
            return;
        }
        tracing::info!("Queuing add/update: {}", path);
        self.queue.enqueue_update(path);
    }

    /// Record that the node at `path` was removed
    pub fn delete(&self, path: &str) {
        if !self.enabled {
            tracing::info!("Instant synchronization not enabled, ignoring delete of {}", path);
            return;
        }
        tracing::info!("Queuing delete: {}", path);
        self.queue.enqueue_delete(path);
    }
}
