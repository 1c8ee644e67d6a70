//! Synchronization State Store
//!
//! Append-only log of job states in the `synch_state` table. The newest row
//! is the current state and doubles as the lock between the three write
//! paths (instant, periodic, full re-index).
//!
//! # Atomic Transitions
//!
//! Every `start_*` method reads the current state and appends the busy record
//! inside a single `BEGIN IMMEDIATE` transaction. SQLite grants that write
//! lock to one connection at a time, so two concurrent callers can never both
//! observe an idle state and both start a job.

use crate::db::database::{DatabaseService, SyncTransaction};
use crate::db::error::DatabaseError;
use crate::models::{StartOutcome, SyncState, SyncStateRecord, ERROR_PREFIX, SUCCESS_MESSAGE};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Connection;

/// Message of the record written when a full re-index starts
pub const REINDEX_MESSAGE: &str = "Complete re-index started";

/// Message of the record written by `disable()`
const DISABLED_MESSAGE: &str = "Disabled by operator";

/// Format of the checkpoint in the periodic update message
const CHECKPOINT_MESSAGE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

const SELECT_COLUMNS: &str = "SELECT id, state, msg, created_at FROM synch_state";

/// Reads and appends `synch_state` records
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    db: DatabaseService,
}

impl SyncStateStore {
    pub fn new(db: DatabaseService) -> Self {
        Self { db }
    }

    /// Most recent record, `None` for an empty log
    pub async fn latest(&self) -> Result<Option<SyncStateRecord>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        latest_on(&conn).await
    }

    /// Current state; an empty log counts as `Operational`
    pub async fn current_state(&self) -> Result<SyncState, DatabaseError> {
        Ok(self
            .latest()
            .await?
            .map(|record| record.state)
            .unwrap_or(SyncState::Operational))
    }

    pub async fn is_busy(&self) -> Result<bool, DatabaseError> {
        Ok(self.current_state().await?.is_busy())
    }

    pub async fn is_disabled(&self) -> Result<bool, DatabaseError> {
        Ok(self.current_state().await?.is_disabled())
    }

    pub async fn start_reindex(&self) -> Result<StartOutcome, DatabaseError> {
        self.try_start(SyncState::Reindexing, REINDEX_MESSAGE.to_string())
            .await
    }

    pub async fn start_update(&self, path: &str) -> Result<StartOutcome, DatabaseError> {
        self.try_start(SyncState::Updating, format!("Updating `{}`", path))
            .await
    }

    pub async fn start_delete(&self, path: &str) -> Result<StartOutcome, DatabaseError> {
        self.try_start(SyncState::Updating, format!("Deleting `{}`", path))
            .await
    }

    pub async fn start_periodic_update(
        &self,
        checkpoint: DateTime<Utc>,
    ) -> Result<StartOutcome, DatabaseError> {
        self.try_start(
            SyncState::PeriodicUpdate,
            format!(
                "Looking for changes since {}",
                checkpoint.format(CHECKPOINT_MESSAGE_FORMAT)
            ),
        )
        .await
    }

    /// Append `Operational` with the success message
    pub async fn finished(&self) -> Result<(), DatabaseError> {
        self.finish_job(SUCCESS_MESSAGE).await
    }

    /// Append `Operational` keeping the error text for inspection
    pub async fn finished_with_error(&self, message: &str) -> Result<(), DatabaseError> {
        self.finish_job(&format!("{}{}", ERROR_PREFIX, message))
            .await
    }

    /// Halt all synchronization until `enable()`
    ///
    /// A job that is still running finishes normally; its outcome is recorded
    /// and the log is put back into `Disabled` right after it.
    pub async fn disable(&self) -> Result<(), DatabaseError> {
        self.append(SyncState::Disabled, DISABLED_MESSAGE).await
    }

    pub async fn enable(&self) -> Result<(), DatabaseError> {
        self.append(SyncState::Operational, "").await
    }

    /// Delete the whole log
    ///
    /// Clears a state left busy by a crashed job. Periodic updates stay
    /// skipped until the next successful re-index, since the checkpoint is
    /// gone with the log.
    pub async fn reset(&self) -> Result<u64, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        conn.execute("DELETE FROM synch_state", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to reset state log: {}", e))
            })
    }

    /// Most recent records, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SyncStateRecord>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY id DESC LIMIT ?", SELECT_COLUMNS))
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt.query([limit as i64]).await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Start time of the most recent successful re-index or periodic update
    ///
    /// A start record counts when the record right after it is a success.
    /// The start time bounds the next catch-up scan, so changes made while
    /// that job ran are looked at again.
    pub async fn last_checkpoint(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut stmt = conn
            .prepare(
                "SELECT s.created_at FROM synch_state s
                 WHERE s.state IN ('reindexing', 'periodic_update')
                   AND EXISTS (
                       SELECT 1 FROM synch_state n
                       WHERE n.id = (SELECT MIN(id) FROM synch_state WHERE id > s.id)
                         AND n.state = 'operational'
                         AND substr(n.msg, 1, length(?1)) != ?1
                   )
                 ORDER BY s.id DESC LIMIT 1",
            )
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
        let mut rows = stmt.query([ERROR_PREFIX]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_timestamp(&row.get::<String>(0)?)?)),
            None => Ok(None),
        }
    }

    /// Record the outcome of a job, keeping an operator's `Disabled` in force
    async fn finish_job(&self, message: &str) -> Result<(), DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut tx = SyncTransaction::begin(conn).await?;

        if let Err(e) = record_outcome(tx.conn(), message).await {
            tx.rollback_quietly().await;
            return Err(e);
        }
        tx.commit().await
    }

    async fn append(&self, state: SyncState, message: &str) -> Result<(), DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        insert_record(&conn, state, message).await
    }

    /// Compare-and-set: append `state` only when the current state admits a job
    async fn try_start(
        &self,
        state: SyncState,
        message: String,
    ) -> Result<StartOutcome, DatabaseError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut tx = SyncTransaction::begin(conn).await?;

        let outcome = match check_and_insert(tx.conn(), state, &message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tx.rollback_quietly().await;
                return Err(e);
            }
        };

        if outcome.is_started() {
            tx.commit().await?;
            tracing::info!("Synchronization state -> {}: {}", state, message);
        } else {
            tx.rollback_quietly().await;
            tracing::debug!("Refused to enter {}: {:?}", state, outcome);
        }
        Ok(outcome)
    }
}

async fn check_and_insert(
    conn: &Connection,
    state: SyncState,
    message: &str,
) -> Result<StartOutcome, DatabaseError> {
    let current = latest_on(conn)
        .await?
        .map(|record| record.state)
        .unwrap_or(SyncState::Operational);

    if current.is_disabled() {
        return Ok(StartOutcome::Disabled);
    }
    if current.is_busy() {
        return Ok(StartOutcome::Busy(current));
    }

    insert_record(conn, state, message).await?;
    Ok(StartOutcome::Started)
}

async fn record_outcome(conn: &Connection, message: &str) -> Result<(), DatabaseError> {
    let disabled = latest_on(conn)
        .await?
        .is_some_and(|record| record.state.is_disabled());

    insert_record(conn, SyncState::Operational, message).await?;
    if disabled {
        tracing::info!("Job finished while disabled, synchronization stays disabled");
        insert_record(conn, SyncState::Disabled, DISABLED_MESSAGE).await?;
    }
    Ok(())
}

async fn latest_on(conn: &Connection) -> Result<Option<SyncStateRecord>, DatabaseError> {
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY id DESC LIMIT 1", SELECT_COLUMNS))
        .await
        .map_err(|e| DatabaseError::sql_execution(format!("Failed to prepare query: {}", e)))?;
    let mut rows = stmt.query(()).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_record(&row)?)),
        None => Ok(None),
    }
}

async fn insert_record(
    conn: &Connection,
    state: SyncState,
    message: &str,
) -> Result<(), DatabaseError> {
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    conn.execute(
        "INSERT INTO synch_state (state, msg, created_at) VALUES (?, ?, ?)",
        [state.as_str(), message, created_at.as_str()],
    )
    .await
    .map_err(|e| {
        DatabaseError::sql_execution(format!("Failed to record state {}: {}", state, e))
    })?;
    Ok(())
}

fn row_to_record(row: &libsql::Row) -> Result<SyncStateRecord, DatabaseError> {
    let state = row
        .get::<String>(1)?
        .parse::<SyncState>()
        .map_err(|e| DatabaseError::corrupt_row("synch_state", e.to_string()))?;

    Ok(SyncStateRecord {
        id: row.get::<i64>(0)?,
        state,
        message: row.get::<String>(2)?,
        created_at: parse_timestamp(&row.get::<String>(3)?)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            DatabaseError::corrupt_row("synch_state", format!("bad timestamp `{}`: {}", value, e))
        })
}
