//! Treemirror Core
//!
//! Keeps a relational mirror of a hierarchical content tree up to date.
//! Every source node becomes one row in the `node` table and every textual
//! property value one row in the `property` table.
//!
//! # Architecture
//!
//! - **Instant path**: change notifications land in a deduplicating queue
//! - **Periodic path**: a scheduler drains the queue and upserts or deletes
//!   the affected paths, optionally catching up on nodes modified since the
//!   last successful run
//! - **Full re-index**: truncates the mirror and rebuilds it, handing
//!   property writes to a pool of parallel database workers
//! - **State log**: every job is recorded in `synch_state`, which doubles as
//!   a cluster-wide lock
//!
//! # Modules
//!
//! - [`models`] - Row types, change events, synchronization states
//! - [`config`] - Engine configuration and path filters
//! - [`tree`] - Source tree capability traits and an in-memory tree
//! - [`db`] - libsql connection, schema, persisters and the state store
//! - [`operations`] - Change queue, traversal, visitors, batch writers
//! - [`services`] - Instant, periodic and full re-index jobs
//! - [`utils`] - Value codec and path helpers

pub mod config;
pub mod db;
pub mod models;
pub mod operations;
pub mod services;
pub mod tree;
pub mod utils;

// Re-export commonly used types
pub use config::{ConnectionInfo, PathFilter, SyncConfig};
pub use models::*;
pub use services::*;
