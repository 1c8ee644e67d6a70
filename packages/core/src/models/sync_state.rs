//! Synchronization State Records
//!
//! The `synch_state` table is an append-only log. The newest row is the
//! current state of the mirror; older rows are kept as history for operators.
//!
//! # States
//!
//! - `Operational` - idle, a job may start
//! - `Disabled` - halted by an operator, nothing may start
//! - `Reindexing`, `Updating`, `PeriodicUpdate` - busy, a job is running

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Message written by `finished()`
pub const SUCCESS_MESSAGE: &str = "Operation completed successfully";

/// Prefix of the message written by `finished_with_error()`
pub const ERROR_PREFIX: &str = "Error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Operational,
    Disabled,
    Reindexing,
    #[serde(rename = "update")]
    Updating,
    PeriodicUpdate,
}

impl SyncState {
    /// Value stored in the `state` column
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Operational => "operational",
            SyncState::Disabled => "disabled",
            SyncState::Reindexing => "reindexing",
            SyncState::Updating => "update",
            SyncState::PeriodicUpdate => "periodic_update",
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncState::Reindexing | SyncState::Updating | SyncState::PeriodicUpdate
        )
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, SyncState::Disabled)
    }

    /// Whether a new write job may start from this state
    pub fn admits_job(&self) -> bool {
        !self.is_busy() && !self.is_disabled()
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown synchronization state: {0}")]
pub struct UnknownSyncState(pub String);

impl FromStr for SyncState {
    type Err = UnknownSyncState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operational" => Ok(SyncState::Operational),
            "disabled" => Ok(SyncState::Disabled),
            "reindexing" => Ok(SyncState::Reindexing),
            "update" => Ok(SyncState::Updating),
            "periodic_update" => Ok(SyncState::PeriodicUpdate),
            other => Err(UnknownSyncState(other.to_string())),
        }
    }
}

/// One row of the state log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateRecord {
    pub id: i64,
    pub state: SyncState,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl SyncStateRecord {
    /// True for an `Operational` record written by `finished_with_error()`
    pub fn is_error(&self) -> bool {
        self.state == SyncState::Operational && self.message.starts_with(ERROR_PREFIX)
    }
}

/// Result of an attempt to move the state log into a busy state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The busy record was written, the caller owns the job
    Started,
    /// Another job is active; the caller must skip its run
    Busy(SyncState),
    /// An operator disabled synchronization
    Disabled,
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_column_value() {
        for state in [
            SyncState::Operational,
            SyncState::Disabled,
            SyncState::Reindexing,
            SyncState::Updating,
            SyncState::PeriodicUpdate,
        ] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("paused".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_busy_and_disabled_classification() {
        assert!(SyncState::Reindexing.is_busy());
        assert!(SyncState::Updating.is_busy());
        assert!(SyncState::PeriodicUpdate.is_busy());
        assert!(!SyncState::Operational.is_busy());
        assert!(!SyncState::Disabled.is_busy());

        assert!(SyncState::Disabled.is_disabled());
        assert!(SyncState::Operational.admits_job());
        assert!(!SyncState::Disabled.admits_job());
        assert!(!SyncState::PeriodicUpdate.admits_job());
    }
}
