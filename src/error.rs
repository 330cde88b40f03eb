use thiserror::Error;

#[cfg(feature = "sqlite")]
use rusqlite;
#[cfg(feature = "postgres")]
use tokio_postgres;

/// Every failure surfaced by this crate.
///
/// Driver errors are carried transparently so callers can branch on the
/// driver-level kind (constraint violation, busy, syntax) without unwrapping
/// anything crate-specific.
#[derive(Debug, Error)]
pub enum SqlSessionError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("No session available: {0}")]
    NoSession(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Entity mapping error: {0}")]
    Entity(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),

    #[error("Other database error: {0}")]
    Other(String),
}

impl SqlSessionError {
    /// True when the error came straight from a database driver.
    #[must_use]
    pub fn is_store_error(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            SqlSessionError::PostgresError(_) => true,
            #[cfg(feature = "sqlite")]
            SqlSessionError::SqliteError(_) => true,
            _ => false,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<bb8::RunError<tokio_postgres::Error>> for SqlSessionError {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => SqlSessionError::PostgresError(e),
            bb8::RunError::TimedOut => {
                SqlSessionError::ConnectionError("postgres checkout timed out".into())
            }
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<bb8::RunError<rusqlite::Error>> for SqlSessionError {
    fn from(err: bb8::RunError<rusqlite::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => SqlSessionError::SqliteError(e),
            bb8::RunError::TimedOut => {
                SqlSessionError::ConnectionError("sqlite checkout timed out".into())
            }
        }
    }
}
