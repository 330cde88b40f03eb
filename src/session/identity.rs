use std::collections::HashMap;

use crate::entity::RecordKey;
use crate::results::CustomDbRow;

/// Rows already loaded by a session, keyed by table and primary key.
///
/// Cleared on commit, rollback and close so stale rows never outlive the
/// transaction that read them.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    rows: HashMap<String, CustomDbRow>,
}

impl IdentityMap {
    pub(crate) fn get(&self, key: &RecordKey) -> Option<&CustomDbRow> {
        self.rows.get(&key.identity())
    }

    pub(crate) fn insert(&mut self, key: &RecordKey, row: CustomDbRow) {
        self.rows.insert(key.identity(), row);
    }

    pub(crate) fn forget(&mut self, key: &RecordKey) {
        self.rows.remove(&key.identity());
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}
