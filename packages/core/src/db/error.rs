//! Database Error Types
//!
//! Error types for database operations: connecting to the mirror database,
//! initializing its schema, and executing statements.

use thiserror::Error;

/// Database operation errors
///
/// Covers connection, initialization and statement failures. Job-level
/// handling (rollback, error state) is done by `operations::SyncError`.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish database connection
    #[error("Failed to connect to database at {url}: {source}")]
    ConnectionFailed { url: String, source: libsql::Error },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Connection parameters cannot be used
    #[error("Invalid database connection: {0}")]
    InvalidConnection(String),

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// libsql operation error
    #[error("Database operation failed: {0}")]
    LibsqlError(#[from] libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },

    /// A stored value could not be interpreted
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },
}

impl DatabaseError {
    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, source: libsql::Error) -> Self {
        Self::ConnectionFailed {
            url: url.into(),
            source,
        }
    }

    /// Create an initialization failed error
    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    pub fn invalid_connection(msg: impl Into<String>) -> Self {
        Self::InvalidConnection(msg.into())
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }

    pub fn corrupt_row(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the database could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::InvalidConnection(_)
        )
    }
}
