//! Entity metadata consumed by `get`, `save`, `delete` and `refresh`.
//!
//! Mapping a Rust type to a table is left to the implementor; the session only
//! needs the table name, key columns, the remaining columns and a way to move
//! values in and out of rows.

use crate::error::SqlSessionError;
use crate::results::CustomDbRow;
use crate::session::Session;
use crate::types::RowValues;

/// A type persisted as one row of one table.
///
/// ```rust
/// use sql_session::prelude::*;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Team {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for Team {
///     const TABLE: &'static str = "teams";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     const COLUMNS: &'static [&'static str] = &["name"];
///
///     fn primary_key(&self) -> Vec<RowValues> {
///         vec![self.id.into()]
///     }
///
///     fn values(&self) -> Vec<RowValues> {
///         vec![self.name.clone().into()]
///     }
///
///     fn from_row(row: &CustomDbRow) -> Result<Self, SqlSessionError> {
///         Ok(Team {
///             id: row.get("id").and_then(RowValues::as_int).copied(),
///             name: row
///                 .get("name")
///                 .and_then(RowValues::as_text)
///                 .unwrap_or_default()
///                 .to_string(),
///         })
///     }
///
///     fn assign_key(&mut self, key: &[RowValues]) {
///         self.id = key.first().and_then(RowValues::as_int).copied();
///     }
/// }
/// ```
pub trait Entity: Sized + Send + 'static {
    const TABLE: &'static str;
    /// One or more key columns.
    const PRIMARY_KEY: &'static [&'static str];
    /// Non-key columns, in the order `values()` returns them.
    const COLUMNS: &'static [&'static str];

    /// Key values in `PRIMARY_KEY` order. Unassigned parts are `RowValues::Null`.
    fn primary_key(&self) -> Vec<RowValues>;

    /// Values for `COLUMNS`, same order. `Null` columns are left out of inserts so
    /// server defaults apply.
    fn values(&self) -> Vec<RowValues>;

    /// Build an instance from a row holding the key columns plus whatever
    /// `load_columns` selected.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Entity` when a required column is missing or mistyped.
    fn from_row(row: &CustomDbRow) -> Result<Self, SqlSessionError>;

    /// Store a key generated by the database after an insert.
    fn assign_key(&mut self, key: &[RowValues]);

    /// Columns to select for `get`. Loading hints arrive untouched; the default
    /// ignores them and loads every column.
    fn load_columns(hints: &[String]) -> Vec<String> {
        let _ = hints;
        Self::COLUMNS.iter().map(|c| (*c).to_string()).collect()
    }
}

/// Row lock requested by `get`. Rendered per dialect; `SQLite` has no row locks
/// and ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Update,
    UpdateNowait,
    UpdateSkipLocked,
    Share,
}

/// Options for identity lookups.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Skip the identity map and reload from the store.
    pub populate_existing: bool,
    pub lock: Option<LockMode>,
    /// Eager-loading hints handed to `Entity::load_columns`.
    pub hints: Vec<String>,
    /// Run on this session; the caller keeps commit and close responsibility.
    pub executor: Option<Session>,
}

impl GetOptions {
    #[must_use]
    pub fn populate_existing(mut self, yes: bool) -> Self {
        self.populate_existing = yes;
        self
    }

    #[must_use]
    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }

    #[must_use]
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    #[must_use]
    pub fn executor(mut self, session: &Session) -> Self {
        self.executor = Some(session.clone());
        self
    }
}

/// A primary key value, single or composite.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValues(pub Vec<RowValues>);

impl From<Vec<RowValues>> for KeyValues {
    fn from(values: Vec<RowValues>) -> Self {
        KeyValues(values)
    }
}

impl From<RowValues> for KeyValues {
    fn from(value: RowValues) -> Self {
        KeyValues(vec![value])
    }
}

impl From<i64> for KeyValues {
    fn from(value: i64) -> Self {
        KeyValues(vec![RowValues::Int(value)])
    }
}

impl From<i32> for KeyValues {
    fn from(value: i32) -> Self {
        KeyValues(vec![RowValues::from(value)])
    }
}

impl From<&str> for KeyValues {
    fn from(value: &str) -> Self {
        KeyValues(vec![RowValues::from(value)])
    }
}

impl From<String> for KeyValues {
    fn from(value: String) -> Self {
        KeyValues(vec![RowValues::Text(value)])
    }
}

/// Owned, thread-safe identity of one row.
#[derive(Debug, Clone)]
pub(crate) struct RecordKey {
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
    pub key: Vec<RowValues>,
}

impl RecordKey {
    pub(crate) fn of<E: Entity>(key: Vec<RowValues>) -> Result<Self, SqlSessionError> {
        if key.len() != E::PRIMARY_KEY.len() {
            return Err(SqlSessionError::Entity(format!(
                "{} expects {} key value(s), got {}",
                E::TABLE,
                E::PRIMARY_KEY.len(),
                key.len()
            )));
        }
        Ok(Self {
            table: E::TABLE,
            key_columns: E::PRIMARY_KEY,
            key,
        })
    }

    /// A key with no NULL part identifies an existing or explicit row.
    pub(crate) fn is_populated(&self) -> bool {
        !self.key.is_empty() && self.key.iter().all(|v| !v.is_null())
    }

    pub(crate) fn identity(&self) -> String {
        let mut id = String::from(self.table);
        for part in &self.key {
            id.push('|');
            id.push_str(&part.key_fragment());
        }
        id
    }
}

/// Owned snapshot of an entity's values, safe to move onto a worker thread.
#[derive(Debug, Clone)]
pub(crate) struct EntityRecord {
    pub key: RecordKey,
    pub columns: &'static [&'static str],
    pub values: Vec<RowValues>,
}

impl EntityRecord {
    pub(crate) fn from_entity<E: Entity>(entity: &E) -> Result<Self, SqlSessionError> {
        let values = entity.values();
        if values.len() != E::COLUMNS.len() {
            return Err(SqlSessionError::Entity(format!(
                "{} has {} columns but produced {} values",
                E::TABLE,
                E::COLUMNS.len(),
                values.len()
            )));
        }
        Ok(Self {
            key: RecordKey::of::<E>(entity.primary_key())?,
            columns: E::COLUMNS,
            values,
        })
    }
}

/// Everything `get` needs, with the column list already resolved from hints.
#[derive(Debug, Clone)]
pub(crate) struct KeyLookup {
    pub key: RecordKey,
    pub select: Vec<String>,
    pub populate_existing: bool,
    pub lock: Option<LockMode>,
}

impl KeyLookup {
    pub(crate) fn new<E: Entity>(key: Vec<RowValues>, options: &GetOptions) -> Result<Self, SqlSessionError> {
        let key = RecordKey::of::<E>(key)?;
        let mut select: Vec<String> = E::PRIMARY_KEY.iter().map(|c| (*c).to_string()).collect();
        for column in E::load_columns(&options.hints) {
            if !select.contains(&column) {
                select.push(column);
            }
        }
        Ok(Self {
            key,
            select,
            populate_existing: options.populate_existing,
            lock: options.lock,
        })
    }
}
