//! Database Layer
//!
//! All interaction with the relational mirror goes through this module:
//!
//! - Connection management and schema initialization (`DatabaseService`)
//! - Explicit write transactions (`SyncTransaction`)
//! - Row persistence for nodes and properties
//! - The `synch_state` log used as job lock and history
//! - Per-job performance metrics
//!
//! The mirror is a libsql database, either a local file or a remote libsql
//! server.

mod database;
mod error;
pub mod metrics;
mod node_persister;
mod property_persister;
mod sync_state_store;

pub use database::{DatabaseService, MirrorTable, SyncTransaction};
pub use error::DatabaseError;
pub use metrics::{Counter, SyncMetrics};
pub use node_persister::{NodePersister, StoredNode};
pub use property_persister::{PropertyPersister, MAX_ROWS_PER_STATEMENT};
pub use sync_state_store::{SyncStateStore, REINDEX_MESSAGE};
