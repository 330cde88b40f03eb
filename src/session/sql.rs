//! SQL text for entity operations, per dialect.

use crate::entity::{EntityRecord, KeyLookup, LockMode, RecordKey};
use crate::error::SqlSessionError;
use crate::results::ResultSet;
use crate::translation::PlaceholderStyle;
use crate::types::{DatabaseType, RowValues};

/// A statement ready for `query`.
pub(crate) type Bound = (String, Vec<RowValues>);

/// How to persist one record.
pub(crate) enum SavePlan {
    /// Key is populated: try the update, fall back to an insert when nothing matched.
    /// Key-only tables have no update and check existence instead.
    Upsert {
        update: Option<Bound>,
        exists: Bound,
        insert: Bound,
    },
    /// Key is missing: insert and read the generated key back.
    Insert(Bound),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SqlBuilder {
    dialect: DatabaseType,
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqlBuilder {
    pub(crate) fn new(dialect: DatabaseType) -> Self {
        Self { dialect }
    }

    pub(crate) fn style(self) -> PlaceholderStyle {
        match self.dialect {
            DatabaseType::Postgres => PlaceholderStyle::Postgres,
            DatabaseType::Sqlite => PlaceholderStyle::Sqlite,
        }
    }

    /// `"a" = ?n AND "b" = ?n+1`, numbering from `first`.
    fn key_predicate(self, key: &RecordKey, first: usize) -> String {
        key.key_columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = {}", ident(col), self.style().placeholder(first + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn lock_clause(self, lock: Option<LockMode>) -> &'static str {
        match (self.dialect, lock) {
            (DatabaseType::Sqlite, _) | (_, None) => "",
            (DatabaseType::Postgres, Some(LockMode::Update)) => " FOR UPDATE",
            (DatabaseType::Postgres, Some(LockMode::UpdateNowait)) => " FOR UPDATE NOWAIT",
            (DatabaseType::Postgres, Some(LockMode::UpdateSkipLocked)) => " FOR UPDATE SKIP LOCKED",
            (DatabaseType::Postgres, Some(LockMode::Share)) => " FOR SHARE",
        }
    }

    pub(crate) fn select_by_key(self, lookup: &KeyLookup) -> Bound {
        let columns = lookup
            .select
            .iter()
            .map(|c| ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {columns} FROM {} WHERE {}{}",
            ident(lookup.key.table),
            self.key_predicate(&lookup.key, 1),
            self.lock_clause(lookup.lock)
        );
        (sql, lookup.key.key.clone())
    }

    pub(crate) fn delete(self, key: &RecordKey) -> Bound {
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            ident(key.table),
            self.key_predicate(key, 1)
        );
        (sql, key.key.clone())
    }

    fn exists(self, key: &RecordKey) -> Bound {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {}",
            ident(key.table),
            self.key_predicate(key, 1)
        );
        (sql, key.key.clone())
    }

    fn update(self, record: &EntityRecord) -> Option<Bound> {
        if record.columns.is_empty() {
            return None;
        }
        let assignments = record
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = {}", ident(col), self.style().placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {}",
            ident(record.key.table),
            self.key_predicate(&record.key, record.columns.len() + 1)
        );
        let mut params = record.values.clone();
        params.extend(record.key.key.iter().cloned());
        Some((sql, params))
    }

    /// Insert every non-NULL column so server defaults fill the rest, returning the key.
    fn insert(self, record: &EntityRecord) -> Bound {
        let key_pairs = record.key.key_columns.iter().zip(record.key.key.iter());
        let value_pairs = record.columns.iter().zip(record.values.iter());
        let (columns, params): (Vec<&str>, Vec<RowValues>) = key_pairs
            .chain(value_pairs)
            .filter(|(_, v)| !v.is_null())
            .map(|(c, v)| (*c, v.clone()))
            .unzip();

        let returning = record
            .key
            .key_columns
            .iter()
            .map(|c| ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let table = ident(record.key.table);

        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING {returning}")
        } else {
            let names = columns.iter().map(|c| ident(c)).collect::<Vec<_>>().join(", ");
            let slots = (1..=columns.len())
                .map(|i| self.style().placeholder(i))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {table} ({names}) VALUES ({slots}) RETURNING {returning}")
        };
        (sql, params)
    }

    pub(crate) fn save_plan(self, record: &EntityRecord) -> SavePlan {
        if record.key.is_populated() {
            SavePlan::Upsert {
                update: self.update(record),
                exists: self.exists(&record.key),
                insert: self.insert(record),
            }
        } else {
            SavePlan::Insert(self.insert(record))
        }
    }
}

/// Key values out of an `INSERT ... RETURNING` result.
pub(crate) fn returned_key(record: &EntityRecord, result: &ResultSet) -> Result<Vec<RowValues>, SqlSessionError> {
    let row = result.first().ok_or_else(|| {
        SqlSessionError::Entity(format!(
            "insert into {} returned no key",
            record.key.table
        ))
    })?;
    Ok(row.project(record.key.key_columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: RowValues, name: RowValues, score: RowValues) -> EntityRecord {
        EntityRecord {
            key: RecordKey {
                table: "players",
                key_columns: &["id"],
                key: vec![id],
            },
            columns: &["name", "score"],
            values: vec![name, score],
        }
    }

    #[test]
    fn insert_skips_nulls_and_returns_key() {
        let builder = SqlBuilder::new(DatabaseType::Sqlite);
        let SavePlan::Insert((sql, params)) =
            builder.save_plan(&record(RowValues::Null, "ann".into(), RowValues::Null))
        else {
            panic!("expected insert");
        };
        assert_eq!(sql, r#"INSERT INTO "players" ("name") VALUES (?1) RETURNING "id""#);
        assert_eq!(params, vec![RowValues::Text("ann".into())]);
    }

    #[test]
    fn populated_key_updates_first() {
        let builder = SqlBuilder::new(DatabaseType::Postgres);
        let SavePlan::Upsert { update, insert, .. } =
            builder.save_plan(&record(7.into(), "ann".into(), 3.into()))
        else {
            panic!("expected upsert");
        };
        let (sql, params) = update.unwrap();
        assert_eq!(sql, r#"UPDATE "players" SET "name" = $1, "score" = $2 WHERE "id" = $3"#);
        assert_eq!(params.len(), 3);
        assert_eq!(
            insert.0,
            r#"INSERT INTO "players" ("id", "name", "score") VALUES ($1, $2, $3) RETURNING "id""#
        );
    }

    #[test]
    fn locks_render_on_postgres_only() {
        let lookup = KeyLookup {
            key: RecordKey {
                table: "players",
                key_columns: &["id"],
                key: vec![1.into()],
            },
            select: vec!["id".into(), "name".into()],
            populate_existing: false,
            lock: Some(LockMode::UpdateSkipLocked),
        };
        assert_eq!(
            SqlBuilder::new(DatabaseType::Postgres).select_by_key(&lookup).0,
            r#"SELECT "id", "name" FROM "players" WHERE "id" = $1 FOR UPDATE SKIP LOCKED"#
        );
        assert_eq!(
            SqlBuilder::new(DatabaseType::Sqlite).select_by_key(&lookup).0,
            r#"SELECT "id", "name" FROM "players" WHERE "id" = ?1"#
        );
    }

    #[test]
    fn key_only_rows_insert_default_values() {
        let rec = EntityRecord {
            key: RecordKey {
                table: "tickets",
                key_columns: &["id"],
                key: vec![RowValues::Null],
            },
            columns: &[],
            values: vec![],
        };
        let SavePlan::Insert((sql, _)) = SqlBuilder::new(DatabaseType::Sqlite).save_plan(&rec) else {
            panic!("expected insert");
        };
        assert_eq!(sql, r#"INSERT INTO "tickets" DEFAULT VALUES RETURNING "id""#);
    }
}
