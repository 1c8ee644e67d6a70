//! Change Queue
//!
//! Deduplicating set of pending path operations, fed by change notifications
//! and drained by the periodic reconciler.
//!
//! # Collapse Policy
//!
//! Each path holds at most one pending Update and one pending Delete:
//!
//! - `enqueue_update(p)` marks an Update for `p`
//! - `enqueue_delete(p)` drops any pending Update for `p` and marks a Delete
//!
//! A drained batch is ordered by path, Delete before Update for the same
//! path. So update-then-delete drains as `[Delete]`, delete-then-update as
//! `[Delete, Update]`, and update-delete-update as `[Delete, Update]`. The
//! last operation enqueued always wins.

use crate::models::{ChangeEvent, ChangeOperation};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Pending {
    delete: bool,
    update: bool,
}

/// Thread-safe pending change set
#[derive(Debug, Default)]
pub struct ChangeQueue {
    pending: Mutex<BTreeMap<String, Pending>>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_pending<R>(&self, f: impl FnOnce(&mut BTreeMap<String, Pending>) -> R) -> R {
        // A panicking producer cannot leave the map half-updated, so a
        // poisoned lock is still usable.
        let mut guard = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn enqueue_update(&self, path: impl Into<String>) {
        self.with_pending(|pending| {
            pending.entry(path.into()).or_default().update = true;
        });
    }

    pub fn enqueue_delete(&self, path: impl Into<String>) {
        self.with_pending(|pending| {
            let entry = pending.entry(path.into()).or_default();
            entry.update = false;
            entry.delete = true;
        });
    }

    /// Take every pending operation, leaving the queue empty
    pub fn drain(&self) -> ChangeBatch {
        let taken = self.with_pending(std::mem::take);

        let mut events = Vec::with_capacity(taken.len());
        for (path, pending) in taken {
            if pending.delete {
                events.push(ChangeEvent::delete(path.clone()));
            }
            if pending.update {
                events.push(ChangeEvent::update(path));
            }
        }
        ChangeBatch { events }
    }

    /// Number of pending operations
    pub fn len(&self) -> usize {
        self.with_pending(|pending| {
            pending
                .values()
                .map(|p| usize::from(p.delete) + usize::from(p.update))
                .sum()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Operations taken from the queue by one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Whether the batch carries an Update for `path`
    pub fn has_update(&self, path: &str) -> bool {
        self.events
            .iter()
            .any(|e| e.operation == ChangeOperation::Update && e.path == path)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl IntoIterator for ChangeBatch {
    type Item = ChangeEvent;
    type IntoIter = std::vec::IntoIter<ChangeEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
