use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use tracing::debug;

use super::connection::SqliteConnection;
use crate::engine::{Connection, ConnectionSource, EngineOptions, EngineUrl};
use crate::error::SqlSessionError;
use crate::types::{DatabaseType, EngineMode};

/// bb8 manager for rusqlite connections.
///
/// Every new connection gets the busy timeout, foreign keys and (for files) WAL.
pub struct SqliteManager {
    path: String,
    busy_timeout: Duration,
    wal: bool,
}

impl SqliteManager {
    #[must_use]
    pub fn new(path: impl Into<String>, busy_timeout: Duration, wal: bool) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
            wal,
        }
    }

    fn in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

impl ManageConnection for SqliteManager {
    type Connection = rusqlite::Connection;
    type Error = rusqlite::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let wal = self.wal && !self.in_memory();
        async move {
            let conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            if wal {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            debug!(path = %path, "sqlite connection opened");
            Ok(conn)
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.execute_batch("SELECT 1") }
    }

    /// A connection coming back with a transaction still open (its rollback
    /// failed) is dropped instead of being handed to the next session.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_autocommit()
    }
}

/// Connection source backing `sqlite://` engines.
pub struct SqliteSource {
    pool: Pool<SqliteManager>,
    translate_placeholders: bool,
}

impl SqliteSource {
    /// Build the pool and check out one connection to surface bad paths early.
    ///
    /// An in-memory database lives inside a single connection, so its pool holds
    /// exactly one connection that is never recycled.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` for a non-`SQLite` URL, or the driver
    /// error if the database cannot be opened.
    pub async fn connect(url: &EngineUrl, options: &EngineOptions) -> Result<Self, SqlSessionError> {
        let path = url.sqlite_path().ok_or_else(|| {
            SqlSessionError::ConfigError(format!("{url} is not a sqlite url"))
        })?;
        let manager = SqliteManager::new(path, options.busy_timeout, options.wal);

        let builder = if manager.in_memory() {
            Pool::builder()
                .max_size(1)
                .min_idle(Some(1))
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::builder().max_size(options.max_connections.max(1))
        };
        let pool = builder.build(manager).await?;

        {
            let conn = pool.get().await?;
            conn.execute_batch("SELECT 1")?;
        }

        Ok(Self {
            pool,
            translate_placeholders: options.translate_placeholders,
        })
    }
}

#[async_trait]
impl ConnectionSource for SqliteSource {
    async fn acquire(&self) -> Result<Connection, SqlSessionError> {
        let conn = self.pool.get_owned().await?;
        Ok(Connection::Blocking(Box::new(SqliteConnection::new(conn))))
    }

    fn mode(&self) -> EngineMode {
        EngineMode::Blocking
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn translate_placeholders(&self) -> bool {
        self.translate_placeholders
    }
}
