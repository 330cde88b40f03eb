use std::collections::HashMap;
use std::sync::Arc;

use super::row::{CustomDbRow, index_columns};
use crate::types::RowValues;

/// A fully materialised statement result.
///
/// Never a cursor: every row has been read before the value is handed back, so it
/// remains usable after the owning session is closed.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the statement
    pub results: Vec<CustomDbRow>,
    /// Rows returned (queries) or rows changed (DML)
    pub rows_affected: usize,
    column_names: Option<Arc<Vec<String>>>,
    column_index: Option<Arc<HashMap<String, usize>>>,
}

impl ResultSet {
    /// Create a new result set with a known capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            rows_affected: 0,
            column_names: None,
            column_index: None,
        }
    }

    /// Result of a statement that returned no rows but changed `count` of them.
    #[must_use]
    pub fn from_rows_affected(count: usize) -> ResultSet {
        ResultSet {
            rows_affected: count,
            ..ResultSet::default()
        }
    }

    /// Set the column names for this result set (to be shared by all rows)
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_index = Some(Arc::new(index_columns(&column_names)));
        self.column_names = Some(column_names);
    }

    /// Get the column names for this result set
    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Add a row to the result set. Ignored until column names are set.
    pub fn add_row_values(&mut self, row_values: Vec<RowValues>) {
        if let (Some(names), Some(index)) = (&self.column_names, &self.column_index) {
            self.results.push(CustomDbRow::with_index(
                Arc::clone(names),
                Arc::clone(index),
                row_values,
            ));
            self.rows_affected += 1;
        }
    }

    /// Add an already-built row
    pub fn add_row(&mut self, row: CustomDbRow) {
        if self.column_names.is_none() {
            self.set_column_names(Arc::clone(&row.column_names));
        }
        self.results.push(row);
        self.rows_affected += 1;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&CustomDbRow> {
        self.results.first()
    }

    /// Consume the set and return its first row.
    #[must_use]
    pub fn into_first(self) -> Option<CustomDbRow> {
        self.results.into_iter().next()
    }

    /// First column of the first row; `None` for an empty result.
    #[must_use]
    pub fn scalar(&self) -> Option<RowValues> {
        self.first().and_then(|row| row.get_by_index(0).cloned())
    }

    /// First column of every row.
    #[must_use]
    pub fn scalars(&self) -> Vec<RowValues> {
        self.results
            .iter()
            .filter_map(|row| row.get_by_index(0).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        let mut rs = ResultSet::with_capacity(2);
        rs.set_column_names(Arc::new(vec!["id".into(), "name".into()]));
        rs.add_row_values(vec![RowValues::Int(1), RowValues::Text("a".into())]);
        rs.add_row_values(vec![RowValues::Int(2), RowValues::Text("b".into())]);
        rs
    }

    #[test]
    fn scalar_helpers_read_first_column() {
        let rs = sample();
        assert_eq!(rs.scalar(), Some(RowValues::Int(1)));
        assert_eq!(rs.scalars(), vec![RowValues::Int(1), RowValues::Int(2)]);
        assert_eq!(rs.rows_affected, 2);
    }

    #[test]
    fn rows_resolve_columns_by_name() {
        let rs = sample();
        let row = rs.first().expect("row");
        assert_eq!(row.get("name"), Some(&RowValues::Text("a".into())));
        assert_eq!(row.get("NAME"), Some(&RowValues::Text("a".into())));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn rows_without_columns_are_ignored() {
        let mut rs = ResultSet::default();
        rs.add_row_values(vec![RowValues::Int(1)]);
        assert!(rs.is_empty());
        assert_eq!(ResultSet::from_rows_affected(3).rows_affected, 3);
    }
}
