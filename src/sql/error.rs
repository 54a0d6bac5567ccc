//! Error kinds surfaced by the handler and the engine boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(u32),

    /// Returned when the wait for the next row exceeds the configured
    /// read timeout.
    #[error("row read wait bigger than connection timeout")]
    RowTimeout,

    /// Returned when the liveness poller observes a broken peer socket.
    #[error("connection was closed")]
    ConnectionWasClosed,

    #[error("unsupported operation")]
    UnsupportedOperation,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("analyze error: {0}")]
    Analyze(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("incorrect value: {0}")]
    Convert(String),

    /// An error already cast to its client-facing representation.
    #[error("{message}")]
    Sql {
        code: u16,
        sql_state: &'static str,
        message: String,
    },
}

impl SqlError {
    /// MySQL error code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            SqlError::ConnectionNotFound(_) => 1047,
            SqlError::RowTimeout => 1159,
            SqlError::ConnectionWasClosed => 1053,
            SqlError::UnsupportedOperation => 1235,
            SqlError::Parse(_) => 1064,
            SqlError::Analyze(_) => 1105,
            SqlError::Execution(_) => 1105,
            SqlError::Convert(_) => 1366,
            SqlError::Sql { code, .. } => *code,
        }
    }

    pub fn sql_state(&self) -> &'static str {
        match self {
            SqlError::ConnectionNotFound(_) => "08S01",
            SqlError::RowTimeout => "08S01",
            SqlError::ConnectionWasClosed => "08S01",
            SqlError::UnsupportedOperation => "42000",
            SqlError::Parse(_) => "42000",
            SqlError::Convert(_) => "HY000",
            SqlError::Analyze(_) | SqlError::Execution(_) => "HY000",
            SqlError::Sql { sql_state, .. } => sql_state,
        }
    }
}

/// Cast any handler or engine error into its client-facing SQL
/// representation (error code + SQLSTATE + message). Idempotent.
pub fn cast_sql_error(err: SqlError) -> SqlError {
    match err {
        already @ SqlError::Sql { .. } => already,
        other => SqlError::Sql {
            code: other.code(),
            sql_state: other.sql_state(),
            message: other.to_string(),
        },
    }
}
