use async_trait::async_trait;

use crate::error::SqlSessionError;
use crate::results::ResultSet;
use crate::types::{DatabaseType, EngineMode, RowValues};

/// A pooled connection whose driver calls block the calling thread.
///
/// Only ever driven from a worker thread (see `dispatch`), never from an async task.
pub trait BlockingConnection: Send {
    /// Run one statement. Statements that return columns produce rows; the rest
    /// report `rows_affected`.
    ///
    /// # Errors
    /// Returns the driver error unchanged.
    fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    fn begin(&mut self) -> Result<(), SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    fn commit(&mut self) -> Result<(), SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    fn rollback(&mut self) -> Result<(), SqlSessionError>;

    fn database_type(&self) -> DatabaseType;

    /// Raw driver handle for `run_blocking`.
    #[cfg(feature = "sqlite")]
    fn raw_sqlite(&mut self) -> Option<&mut rusqlite::Connection> {
        None
    }
}

/// A pooled connection whose driver calls are futures.
#[async_trait]
pub trait AsyncConnection: Send {
    /// # Errors
    /// Returns the driver error unchanged.
    async fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    async fn begin(&mut self) -> Result<(), SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    async fn commit(&mut self) -> Result<(), SqlSessionError>;

    /// # Errors
    /// Returns the driver error unchanged.
    async fn rollback(&mut self) -> Result<(), SqlSessionError>;

    fn database_type(&self) -> DatabaseType;
}

/// One checked-out connection of either kind. Dropping it returns it to its pool.
pub enum Connection {
    Blocking(Box<dyn BlockingConnection>),
    Async(Box<dyn AsyncConnection>),
}

impl Connection {
    #[must_use]
    pub fn mode(&self) -> EngineMode {
        match self {
            Connection::Blocking(_) => EngineMode::Blocking,
            Connection::Async(_) => EngineMode::Async,
        }
    }

    #[must_use]
    pub fn database_type(&self) -> DatabaseType {
        match self {
            Connection::Blocking(c) => c.database_type(),
            Connection::Async(c) => c.database_type(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Connection")
            .field(&self.mode())
            .field(&self.database_type())
            .finish()
    }
}

/// Where an engine gets its connections from.
///
/// Implemented by the bundled `SQLite` and Postgres pools; plug your own in with
/// `Engine::from_source`.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    /// Check out a connection. Must hand back the variant matching `mode()`.
    ///
    /// # Errors
    /// Returns a connection or store error when no connection can be produced.
    async fn acquire(&self) -> Result<Connection, SqlSessionError>;

    fn mode(&self) -> EngineMode;

    fn database_type(&self) -> DatabaseType;

    /// Whether statements translate placeholders unless they say otherwise.
    fn translate_placeholders(&self) -> bool {
        false
    }
}
