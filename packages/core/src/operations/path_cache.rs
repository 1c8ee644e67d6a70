//! Per-Job Path Id Cache
//!
//! Memoizes `(path, sub) -> node id` for the lifetime of one job. Each job
//! gets its own cache keyed by the job id; it is dropped when the job ends,
//! so ids never leak from one run into the next.

use crate::models::NodeKey;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
pub struct PathIdCache {
    job_id: Uuid,
    ids: Mutex<HashMap<NodeKey, i64>>,
}

impl PathIdCache {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            ids: Mutex::new(HashMap::new()),
        }
    }

    /// Job this cache belongs to
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn get(&self, key: &NodeKey) -> Option<i64> {
        self.ids.lock().ok().and_then(|ids| ids.get(key).copied())
    }

    pub fn insert(&self, key: NodeKey, id: i64) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(key, id);
        }
    }

    /// Drop the entries of a deleted subtree
    ///
    /// `path` is a page path; with a non-empty `sub` only that part of the
    /// page's content is evicted.
    pub fn evict_subtree(&self, key: &NodeKey) {
        let Ok(mut ids) = self.ids.lock() else {
            return;
        };
        ids.retain(|cached, _| !covers(key, cached));
    }

    pub fn len(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn covers(root: &NodeKey, candidate: &NodeKey) -> bool {
    use crate::utils::paths::is_same_or_descendant;

    if root.sub.is_empty() {
        is_same_or_descendant(&candidate.path, &root.path)
    } else {
        candidate.path == root.path && is_same_or_descendant(&candidate.sub, &root.sub)
    }
}
