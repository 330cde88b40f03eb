use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Statement, params_from_iter};
use tracing::trace;

use super::params::Params;
use crate::error::SqlSessionError;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Extract a `RowValues` from a `SQLite` row.
///
/// # Errors
/// Returns the driver error if the column cannot be read.
pub fn sqlite_extract_value(row: &rusqlite::Row, idx: usize) -> Result<RowValues, SqlSessionError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

/// Run a prepared statement that returns columns and read every row.
///
/// # Errors
/// Returns the driver error if stepping the statement fails.
pub fn build_result_set(stmt: &mut Statement, params: &[Value]) -> Result<ResultSet, SqlSessionError> {
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let col_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(Arc::new(column_names));

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let mut row_values = Vec::with_capacity(col_count);
        for i in 0..col_count {
            row_values.push(sqlite_extract_value(row, i)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

/// Run one statement on a raw connection.
///
/// Row-returning statements (including `RETURNING`) are materialised; anything else
/// reports the changed row count.
///
/// # Errors
/// Returns the driver error unchanged.
pub fn execute_blocking(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[RowValues],
) -> Result<ResultSet, SqlSessionError> {
    trace!(sql, "sqlite statement");
    let values = Params::convert(params);
    let mut stmt = conn.prepare_cached(sql)?;
    if stmt.column_count() == 0 {
        let changed = stmt.execute(params_from_iter(values.as_values().iter()))?;
        Ok(ResultSet::from_rows_affected(changed))
    } else {
        build_result_set(&mut stmt, values.as_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes_on_a_raw_connection() -> Result<(), SqlSessionError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")?;

        let inserted = execute_blocking(
            &conn,
            "INSERT INTO t (name) VALUES (?1), (?2)",
            &["a".into(), "b".into()],
        )?;
        assert_eq!(inserted.rows_affected, 2);
        assert!(inserted.is_empty());

        let rows = execute_blocking(&conn, "SELECT id, name FROM t ORDER BY id", &[])?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.results[1].get("name"), Some(&RowValues::Text("b".into())));

        let returned = execute_blocking(
            &conn,
            "INSERT INTO t (name) VALUES (?1) RETURNING id",
            &["c".into()],
        )?;
        assert_eq!(returned.scalar(), Some(RowValues::Int(3)));
        Ok(())
    }
}
