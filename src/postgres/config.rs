use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::connection::PgConnection;
use crate::engine::{Connection, ConnectionSource, EngineOptions, EngineUrl};
use crate::error::SqlSessionError;
use crate::types::{DatabaseType, EngineMode};

/// bb8 manager for Postgres clients.
pub struct PgManager {
    pub(crate) config: tokio_postgres::Config,
}

impl PgManager {
    #[must_use]
    pub fn new(config: tokio_postgres::Config) -> Self {
        Self { config }
    }
}

impl ManageConnection for PgManager {
    type Connection = Client;
    type Error = tokio_postgres::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        async move {
            debug!(
                hosts = ?cfg.get_hosts(),
                db = ?cfg.get_dbname(),
                user = ?cfg.get_user(),
                "postgres connect start"
            );
            let (client, connection) = cfg.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection task ended");
                }
            });
            Ok(client)
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.simple_query("SELECT 1").await.map(|_| ()) }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

/// Connection source backing `postgres://` engines.
pub struct PgSource {
    pool: Pool<PgManager>,
    translate_placeholders: bool,
}

impl PgSource {
    /// Build the pool from the URL and check out one client.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` for an unparsable URL, or the driver
    /// error if the server cannot be reached.
    pub async fn connect(url: &EngineUrl, options: &EngineOptions) -> Result<Self, SqlSessionError> {
        let config = tokio_postgres::Config::from_str(&format!("postgresql://{}", url.rest()))
            .map_err(|e| SqlSessionError::ConfigError(format!("invalid postgres url: {e}")))?;

        let pool = Pool::builder()
            .max_size(options.max_connections.max(1))
            .build(PgManager::new(config))
            .await?;

        {
            let client = pool.get().await?;
            client.simple_query("SELECT 1").await?;
        }

        Ok(Self {
            pool,
            translate_placeholders: options.translate_placeholders,
        })
    }
}

#[async_trait]
impl ConnectionSource for PgSource {
    async fn acquire(&self) -> Result<Connection, SqlSessionError> {
        let client = self.pool.get_owned().await?;
        Ok(Connection::Async(Box::new(PgConnection::new(client))))
    }

    fn mode(&self) -> EngineMode {
        EngineMode::Async
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn translate_placeholders(&self) -> bool {
        self.translate_placeholders
    }
}
