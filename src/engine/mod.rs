//! Engine handles: one shared connection source per database.

mod backend;
mod url;

pub use backend::{AsyncConnection, BlockingConnection, Connection, ConnectionSource};
pub use url::{Driver, EngineUrl};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::SqlSessionError;
use crate::types::{DatabaseType, EngineMode};

/// Options handed to the engine's driver pool.
///
/// Deserializable so it can sit in an application config file; missing fields
/// take their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub max_connections: u32,
    /// Translate `$N`/`?N` placeholders to the engine's style by default.
    pub translate_placeholders: bool,
    /// How long `SQLite` waits on a locked database before failing with `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    /// Put `SQLite` files in WAL journal mode on connect.
    pub wal: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            translate_placeholders: false,
            busy_timeout: Duration::from_secs(5),
            wal: true,
        }
    }
}

impl EngineOptions {
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn translate_placeholders(mut self, yes: bool) -> Self {
        self.translate_placeholders = yes;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn wal(mut self, yes: bool) -> Self {
        self.wal = yes;
        self
    }
}

struct EngineInner {
    source: Box<dyn ConnectionSource>,
    closed: AtomicBool,
}

/// Shared, pool-backed handle to one database. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.mode())
            .field("database_type", &self.database_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Engine {
    /// Build the engine a URL asks for.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` when the driver is not compiled in,
    /// or the pool's error when the first connection cannot be made.
    pub async fn connect(url: &EngineUrl, options: &EngineOptions) -> Result<Self, SqlSessionError> {
        debug!(url = %url.with_default_driver(), "building engine");
        match url.driver() {
            #[cfg(feature = "sqlite")]
            Driver::Rusqlite => {
                let source = crate::sqlite::SqliteSource::connect(url, options).await?;
                Ok(Self::from_source(source))
            }
            #[cfg(feature = "postgres")]
            Driver::TokioPostgres => {
                let source = crate::postgres::PgSource::connect(url, options).await?;
                Ok(Self::from_source(source))
            }
            #[allow(unreachable_patterns)]
            other => Err(SqlSessionError::ConfigError(format!(
                "driver {} is not enabled in this build",
                other.name()
            ))),
        }
    }

    /// Wrap a custom connection source.
    pub fn from_source(source: impl ConnectionSource) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                source: Box::new(source),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.inner.source.mode()
    }

    #[must_use]
    pub fn database_type(&self) -> DatabaseType {
        self.inner.source.database_type()
    }

    #[must_use]
    pub fn translate_placeholders(&self) -> bool {
        self.inner.source.translate_placeholders()
    }

    /// Check out one connection.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConnectionError` after `shutdown`, otherwise
    /// whatever the source reports.
    pub async fn acquire(&self) -> Result<Connection, SqlSessionError> {
        if self.is_closed() {
            return Err(SqlSessionError::ConnectionError(
                "engine has been shut down".into(),
            ));
        }
        let conn = self.inner.source.acquire().await?;
        if conn.mode() != self.mode() {
            return Err(SqlSessionError::ExecutionError(format!(
                "connection source declared {:?} but produced a {:?} connection",
                self.mode(),
                conn.mode()
            )));
        }
        Ok(conn)
    }

    /// Refuse further checkouts. Connections already handed out stay valid until
    /// they are returned.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(database_type = ?self.database_type(), "engine shut down");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
