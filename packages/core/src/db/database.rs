//! Database Connection Management
//!
//! Connection handling and schema initialization for the relational mirror,
//! using libsql. The mirror can live in a local database file or on a remote
//! libsql server; both are reached through [`DatabaseService`].
//!
//! # Connection Patterns
//!
//! **Always use `connect_with_timeout()`** in async code. Every job and every
//! batch worker owns its own connection; the busy timeout lets concurrent
//! writers wait for the write lock instead of failing with `SQLITE_BUSY`.
//!
//! ```no_run
//! # use treemirror_core::db::DatabaseService;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseService::new_local("./data/mirror.db").await?;
//! let conn = db.connect_with_timeout().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! Writes run inside explicit `BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK`
//! statements, wrapped by [`SyncTransaction`].

use crate::config::{ConnectionInfo, DEFAULT_BUSY_TIMEOUT_MS};
use crate::db::error::DatabaseError;
use libsql::{Builder, Connection, Database};
use std::path::Path;
use std::sync::Arc;

/// Database service for managing the libsql handle and schema
#[derive(Clone)]
pub struct DatabaseService {
    /// libsql database handle (wrapped in Arc for sharing)
    pub db: Arc<Database>,

    /// Connection parameters the handle was built from
    pub connection: ConnectionInfo,

    busy_timeout_ms: u64,
}

impl std::fmt::Debug for DatabaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseService")
            .field("url", &self.connection.url)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .finish()
    }
}

impl DatabaseService {
    /// Open the database described by `connection` and initialize the schema
    ///
    /// For local databases the parent directory is created when missing and
    /// WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if:
    /// - The connection parameters are empty
    /// - Parent directory cannot be created
    /// - Database connection fails
    /// - Schema initialization fails
    pub async fn new(
        connection: &ConnectionInfo,
        busy_timeout_ms: u64,
    ) -> Result<Self, DatabaseError> {
        if connection.is_incomplete() {
            return Err(DatabaseError::invalid_connection(
                "no database url configured",
            ));
        }

        let db = if connection.is_remote() {
            let token = connection.auth_token.clone().unwrap_or_default();
            Builder::new_remote(connection.url.clone(), token)
                .build()
                .await
                .map_err(|e| DatabaseError::connection_failed(&connection.url, e))?
        } else {
            let path = connection
                .local_path()
                .ok_or_else(|| DatabaseError::invalid_connection(&connection.url))?;

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            Builder::new_local(path)
                .build()
                .await
                .map_err(|e| DatabaseError::connection_failed(&connection.url, e))?
        };

        let service = Self {
            db: Arc::new(db),
            connection: connection.clone(),
            busy_timeout_ms,
        };

        service.initialize_schema().await?;

        Ok(service)
    }

    /// Open a local database file with the default busy timeout
    pub async fn new_local(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::new(&ConnectionInfo::local(path), DEFAULT_BUSY_TIMEOUT_MS).await
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements may return rows, so they go through `query()`.
    async fn execute_pragma(&self, conn: &Connection, pragma: &str) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Create tables and indexes
    ///
    /// Uses `CREATE TABLE IF NOT EXISTS`, so it is safe to call on every start.
    ///
    /// # Schema
    ///
    /// - `node`: one row per mirrored node, unique on `(path, sub)`
    /// - `property`: one row per textual property value, owned by a node
    /// - `synch_state`: append-only job state log
    async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        if !self.connection.is_remote() {
            self.execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                site TEXT NOT NULL,
                sub TEXT NOT NULL DEFAULT '',
                resource_type TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                parent_id INTEGER NULL,
                -- Parent deletion keeps the child row, only the pointer goes
                FOREIGN KEY (parent_id) REFERENCES node(id) ON DELETE SET NULL,
                UNIQUE (path, sub)
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!("Failed to create node table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS property (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                sub TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                FOREIGN KEY (node_id) REFERENCES node(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create property table: {}",
                e
            ))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS synch_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                msg TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create synch_state table: {}",
                e
            ))
        })?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_node_path ON node(path)",
            "CREATE INDEX IF NOT EXISTS idx_node_parent ON node(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_property_node ON property(node_id)",
            "CREATE INDEX IF NOT EXISTS idx_property_path ON property(path)",
            "CREATE INDEX IF NOT EXISTS idx_property_name ON property(name)",
            "CREATE INDEX IF NOT EXISTS idx_synch_state_state ON synch_state(state)",
        ];
        for index in indexes {
            conn.execute(index, ()).await.map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create index '{}': {}",
                    index, e
                ))
            })?;
        }

        Ok(())
    }

    /// Get a raw connection without any per-connection settings
    ///
    /// Prefer `connect_with_timeout()`; this is only for short synchronous
    /// inspection where no other writer can be active.
    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::LibsqlError)
    }

    /// Get a connection with busy timeout and foreign keys configured
    ///
    /// Both settings are per connection in SQLite, so every connection the
    /// engine uses is opened through here.
    pub async fn connect_with_timeout(&self) -> Result<Connection, DatabaseError> {
        let conn = self.connect()?;

        self.execute_pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms),
        )
        .await?;
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON").await?;

        Ok(conn)
    }

    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms
    }

    /// Open a connection and start a write transaction on it
    pub async fn begin(&self) -> Result<SyncTransaction, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        SyncTransaction::begin(conn).await
    }

    /// Count rows of a mirror table
    pub async fn count_rows(&self, table: MirrorTable) -> Result<i64, DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to count rows: {}", e)))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::sql_execution(format!("Failed to count rows: {}", e)))?
            .ok_or_else(|| DatabaseError::sql_execution("COUNT returned no row"))?;
        Ok(row.get::<i64>(0)?)
    }

    /// Flush the WAL into the main database file
    pub async fn checkpoint(&self) -> Result<(), DatabaseError> {
        if self.connection.is_remote() {
            return Ok(());
        }
        let conn = self.connect_with_timeout().await?;
        self.execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)")
            .await
    }
}

/// Tables of the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorTable {
    Node,
    Property,
    SynchState,
}

impl MirrorTable {
    pub fn name(&self) -> &'static str {
        match self {
            MirrorTable::Node => "node",
            MirrorTable::Property => "property",
            MirrorTable::SynchState => "synch_state",
        }
    }
}

/// Explicit write transaction on one connection
///
/// Tracks whether a transaction is open so commit and rollback are safe to
/// call at any point, and counts commits for the traversal statistics.
pub struct SyncTransaction {
    conn: Connection,
    open: bool,
    commits: usize,
}

impl SyncTransaction {
    /// Start a `BEGIN IMMEDIATE` transaction on `conn`
    pub async fn begin(conn: Connection) -> Result<Self, DatabaseError> {
        let mut tx = Self::idle(conn);
        tx.ensure_open().await?;
        Ok(tx)
    }

    /// Wrap `conn` without starting a transaction
    pub fn idle(conn: Connection) -> Self {
        Self {
            conn,
            open: false,
            commits: 0,
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of successful commits on this transaction handle
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Start a transaction unless one is already open
    pub async fn ensure_open(&mut self) -> Result<(), DatabaseError> {
        if self.open {
            return Ok(());
        }
        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| {
                DatabaseError::sql_execution(format!("Failed to begin transaction: {}", e))
            })?;
        self.open = true;
        Ok(())
    }

    /// Commit the open transaction, if any
    pub async fn commit(&mut self) -> Result<(), DatabaseError> {
        if !self.open {
            return Ok(());
        }
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.rollback_quietly().await;
            return Err(DatabaseError::sql_execution(format!(
                "Failed to commit transaction: {}",
                e
            )));
        }
        self.open = false;
        self.commits += 1;
        Ok(())
    }

    /// Roll back the open transaction, if any
    pub async fn rollback(&mut self) -> Result<(), DatabaseError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.conn.execute("ROLLBACK", ()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to roll back transaction: {}", e))
        })?;
        Ok(())
    }

    /// Roll back and log instead of returning a failure
    pub async fn rollback_quietly(&mut self) {
        if let Err(e) = self.rollback().await {
            tracing::warn!("Rollback failed: {}", e);
        }
    }
}
