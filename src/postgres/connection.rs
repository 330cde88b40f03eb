use async_trait::async_trait;
use bb8::PooledConnection;
use tracing::trace;

use super::config::PgManager;
use super::params::Params;
use super::query::build_result_set_from_statement;
use crate::engine::AsyncConnection;
use crate::error::SqlSessionError;
use crate::results::ResultSet;
use crate::types::{DatabaseType, RowValues};

/// A pooled `tokio-postgres` client.
pub struct PgConnection {
    client: PooledConnection<'static, PgManager>,
}

impl PgConnection {
    pub(crate) fn new(client: PooledConnection<'static, PgManager>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AsyncConnection for PgConnection {
    async fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError> {
        trace!(sql, "postgres statement");
        let stmt = self.client.prepare(sql).await?;
        let converted = Params::convert(params);
        if stmt.columns().is_empty() {
            let changed = self.client.execute(&stmt, converted.as_refs()).await?;
            let changed = usize::try_from(changed).map_err(|e| {
                SqlSessionError::ExecutionError(format!(
                    "postgres affected rows conversion error: {e}"
                ))
            })?;
            Ok(ResultSet::from_rows_affected(changed))
        } else {
            let rows = self.client.query(&stmt, converted.as_refs()).await?;
            build_result_set_from_statement(&stmt, &rows)
        }
    }

    async fn begin(&mut self) -> Result<(), SqlSessionError> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SqlSessionError> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SqlSessionError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }
}
