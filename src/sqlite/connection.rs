use std::thread;
use std::time::Duration;

use bb8::PooledConnection;

use super::config::SqliteManager;
use super::query::execute_blocking;
use crate::engine::BlockingConnection;
use crate::error::SqlSessionError;
use crate::results::ResultSet;
use crate::types::{DatabaseType, RowValues};

const ROLLBACK_BUSY_RETRIES: &[Duration] =
    &[Duration::from_millis(10), Duration::from_millis(25), Duration::from_millis(50)];

/// A pooled rusqlite connection.
pub struct SqliteConnection {
    conn: PooledConnection<'static, SqliteManager>,
}

impl SqliteConnection {
    pub(crate) fn new(conn: PooledConnection<'static, SqliteManager>) -> Self {
        Self { conn }
    }
}

fn is_busy(err: &SqlSessionError) -> bool {
    matches!(
        err,
        SqlSessionError::SqliteError(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
    )
}

/// Run `attempt`, retrying after each delay while it reports `SQLITE_BUSY`. The
/// last busy error is returned unchanged once the delays run out.
fn retry_busy(
    delays: &[Duration],
    mut attempt: impl FnMut() -> Result<(), SqlSessionError>,
) -> Result<(), SqlSessionError> {
    let mut delays = delays.iter().copied();
    loop {
        match attempt() {
            Err(err) if is_busy(&err) => match delays.next() {
                Some(delay) => thread::sleep(delay),
                None => return Err(err),
            },
            other => return other,
        }
    }
}

/// `ROLLBACK` can hit `SQLITE_BUSY` while another connection checkpoints; retry a
/// few times before giving up.
pub(crate) fn rollback_with_busy_retries(conn: &rusqlite::Connection) -> Result<(), SqlSessionError> {
    retry_busy(ROLLBACK_BUSY_RETRIES, || {
        conn.execute_batch("ROLLBACK")
            .map_err(SqlSessionError::SqliteError)
    })
}

impl BlockingConnection for SqliteConnection {
    fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError> {
        execute_blocking(&self.conn, sql, params)
    }

    fn begin(&mut self) -> Result<(), SqlSessionError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SqlSessionError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SqlSessionError> {
        rollback_with_busy_retries(&self.conn)
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn raw_sqlite(&mut self) -> Option<&mut rusqlite::Connection> {
        Some(&mut *self.conn)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn busy() -> SqlSessionError {
        SqlSessionError::SqliteError(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn every_delay_gets_another_attempt() {
        let calls = Cell::new(0);
        let result = retry_busy(ROLLBACK_BUSY_RETRIES, || {
            calls.set(calls.get() + 1);
            if calls.get() <= ROLLBACK_BUSY_RETRIES.len() {
                Err(busy())
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), ROLLBACK_BUSY_RETRIES.len() + 1);
    }

    #[test]
    fn gives_back_the_busy_error_when_out_of_retries() {
        let calls = Cell::new(0);
        let result = retry_busy(&[Duration::from_millis(1)], || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert_eq!(calls.get(), 2);
        assert!(result.as_ref().is_err_and(is_busy));
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result = retry_busy(ROLLBACK_BUSY_RETRIES, || {
            calls.set(calls.get() + 1);
            Err(SqlSessionError::ExecutionError("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
