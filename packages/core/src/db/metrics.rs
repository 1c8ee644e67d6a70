//! Synchronization Metrics
//!
//! Per-job collector for time spent in each phase of a synchronization and
//! for row counters. One collector is created per job and shared (behind an
//! `Arc`) with the traversal and the batch workers; nothing is process-wide.
//!
//! # Usage
//!
//! ```rust
//! use treemirror_core::db::metrics::{Counter, SyncMetrics};
//! use std::time::Duration;
//!
//! let metrics = SyncMetrics::new();
//! metrics.record("persist.insert", Duration::from_millis(3));
//! metrics.increment(Counter::NodesInserted, 1);
//!
//! println!("{}", metrics.generate_report());
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Row and operation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    NodesVisited,
    NodesInserted,
    NodesUpdated,
    NodesDeleted,
    PropertiesWritten,
    BatchesSubmitted,
    BatchesFailed,
    Commits,
}

const COUNTERS: [Counter; 8] = [
    Counter::NodesVisited,
    Counter::NodesInserted,
    Counter::NodesUpdated,
    Counter::NodesDeleted,
    Counter::PropertiesWritten,
    Counter::BatchesSubmitted,
    Counter::BatchesFailed,
    Counter::Commits,
];

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::NodesVisited => "nodes.visited",
            Counter::NodesInserted => "nodes.inserted",
            Counter::NodesUpdated => "nodes.updated",
            Counter::NodesDeleted => "nodes.deleted",
            Counter::PropertiesWritten => "properties.written",
            Counter::BatchesSubmitted => "batches.submitted",
            Counter::BatchesFailed => "batches.failed",
            Counter::Commits => "commits",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Aggregated timing of one category
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CategoryStats {
    /// Number of samples
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl CategoryStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Metrics collector for one synchronization job
#[derive(Debug)]
pub struct SyncMetrics {
    started: Instant,
    categories: Mutex<BTreeMap<String, CategoryStats>>,
    counters: [AtomicU64; COUNTERS.len()],
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            categories: Mutex::new(BTreeMap::new()),
            counters: Default::default(),
        }
    }

    /// Record time spent in `category`
    pub fn record(&self, category: &str, elapsed: Duration) {
        let Ok(mut categories) = self.categories.lock() else {
            return;
        };
        let stats = categories.entry(category.to_string()).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }

    pub fn increment(&self, counter: Counter, by: u64) {
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Statistics for one category, `None` if nothing was recorded
    pub fn stats_for(&self, category: &str) -> Option<CategoryStats> {
        self.categories
            .lock()
            .ok()
            .and_then(|categories| categories.get(category).copied())
    }

    /// All categories with their statistics, ordered by name
    pub fn categories(&self) -> Vec<(String, CategoryStats)> {
        self.categories
            .lock()
            .map(|categories| {
                categories
                    .iter()
                    .map(|(name, stats)| (name.clone(), *stats))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Wall-clock time since the collector was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Nodes written (inserted or updated) per second of wall-clock time
    pub fn nodes_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        let nodes = self.counter(Counter::NodesInserted) + self.counter(Counter::NodesUpdated);
        if secs > 0.0 {
            nodes as f64 / secs
        } else {
            0.0
        }
    }

    /// Formatted performance report
    ///
    /// Total time, node count and throughput, then one
    /// `category: seconds` line per timing category and the counters.
    pub fn generate_report(&self) -> String {
        let nodes = self.counter(Counter::NodesInserted) + self.counter(Counter::NodesUpdated);

        let mut report = String::new();
        report.push_str("=== Synchronization Performance Report ===\n");
        report.push_str(&format!(
            "Total time: {:.2}s | Nodes: {} | {:.2} nodes/s\n",
            self.elapsed().as_secs_f64(),
            nodes,
            self.nodes_per_second()
        ));

        for (category, stats) in self.categories() {
            report.push_str(&format!(
                "{:<40}: {:.2}\n",
                category,
                stats.total.as_secs_f64()
            ));
        }

        for counter in COUNTERS {
            let value = self.counter(counter);
            if value > 0 {
                report.push_str(&format!("{:<40}: {}\n", counter.name(), value));
            }
        }

        report
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}
