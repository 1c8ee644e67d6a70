//! Data Models
//!
//! Plain data carried between the source tree, the queue and the relational
//! mirror:
//!
//! - `ContentNode` / `PropertyRecord` - rows of the `node` and `property` tables
//! - `ChangeEvent` - a queued path operation
//! - `SyncState` / `SyncStateRecord` - entries of the `synch_state` log

mod change;
mod content_node;
mod sync_state;

pub use change::{ChangeEvent, ChangeOperation};
pub use content_node::{ContentNode, NodeKey, PropertyBatch, PropertyRecord};
pub use sync_state::{
    StartOutcome, SyncState, SyncStateRecord, UnknownSyncState, ERROR_PREFIX, SUCCESS_MESSAGE,
};
