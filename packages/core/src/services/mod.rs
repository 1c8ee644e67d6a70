//! Synchronization Services
//!
//! - `InstantSynchronizer` - turns change notifications into queued events
//! - `PeriodicReconciler` - applies queued events on a schedule
//! - `FullReindexer` - truncates and rebuilds the mirror
//! - `SyncEngine` - owns the shared pieces and the operator surface

mod full_reindexer;
mod instant_synchronizer;
mod periodic_reconciler;
mod sync_engine;

pub use full_reindexer::{FullReindexer, ReindexOutcome, ReindexReport, TriggerResult};
pub use instant_synchronizer::InstantSynchronizer;
pub use periodic_reconciler::{
    PeriodicReconciler, ReconcileOutcome, ReconcileReport, ReconcilerHandle,
};
pub use sync_engine::{DirectOutcome, SyncEngine, SyncStatus};
