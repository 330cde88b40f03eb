//! Session work for engines whose driver blocks. Everything here runs on a worker
//! thread from the dispatch bridge.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sql::{SavePlan, returned_key};
use super::{CallPolicy, Finish, Op, OpOutput, PendingChange, Session, SessionState};
use crate::dispatch;
use crate::entity::{EntityRecord, KeyLookup, RecordKey};
use crate::error::SqlSessionError;
use crate::results::{CustomDbRow, ResultSet};
use crate::statement::Statement;
use crate::types::RowValues;

pub(crate) fn ensure_transaction(state: &mut SessionState) -> Result<(), SqlSessionError> {
    if !state.in_transaction {
        state.blocking_conn()?.begin()?;
        state.in_transaction = true;
        debug!(session = state.id(), "transaction started");
    }
    Ok(())
}

pub(crate) fn execute(state: &mut SessionState, stmt: &Statement) -> Result<ResultSet, SqlSessionError> {
    flush(state)?;
    if !stmt.is_read_only() {
        ensure_transaction(state)?;
    }
    let sql = state.translate(stmt);
    state.blocking_conn()?.query(&sql, stmt.parameters())
}

pub(crate) fn get(state: &mut SessionState, lookup: &KeyLookup) -> Result<Option<CustomDbRow>, SqlSessionError> {
    flush(state)?;
    if !lookup.populate_existing
        && lookup.lock.is_none()
        && let Some(row) = state.identity.get(&lookup.key)
    {
        return Ok(Some(row.clone()));
    }
    if lookup.lock.is_some() {
        ensure_transaction(state)?;
    }
    let (sql, params) = state.builder().select_by_key(lookup);
    let row = state.blocking_conn()?.query(&sql, &params)?.into_first();
    match &row {
        Some(found) => state.identity.insert(&lookup.key, found.clone()),
        None => state.identity.forget(&lookup.key),
    }
    Ok(row)
}

fn save_record(state: &mut SessionState, record: &EntityRecord) -> Result<Vec<RowValues>, SqlSessionError> {
    ensure_transaction(state)?;
    let plan = state.builder().save_plan(record);
    let conn = state.blocking_conn()?;
    let key = match plan {
        SavePlan::Upsert {
            update,
            exists,
            insert,
        } => {
            let matched = match update {
                Some((sql, params)) => conn.query(&sql, &params)?.rows_affected > 0,
                None => !conn.query(&exists.0, &exists.1)?.is_empty(),
            };
            if !matched {
                conn.query(&insert.0, &insert.1)?;
            }
            record.key.key.clone()
        }
        SavePlan::Insert((sql, params)) => returned_key(record, &conn.query(&sql, &params)?)?,
    };
    state.identity.forget(&record.key);
    Ok(key)
}

fn delete(state: &mut SessionState, key: &RecordKey) -> Result<usize, SqlSessionError> {
    ensure_transaction(state)?;
    let (sql, params) = state.builder().delete(key);
    let changed = state.blocking_conn()?.query(&sql, &params)?.rows_affected;
    state.identity.forget(key);
    Ok(changed)
}

/// Write staged changes in order.
pub(crate) fn flush(state: &mut SessionState) -> Result<(), SqlSessionError> {
    if state.pending.is_empty() {
        return Ok(());
    }
    let pending = std::mem::take(&mut state.pending);
    debug!(session = state.id(), changes = pending.len(), "flushing");
    for change in pending {
        match change {
            PendingChange::Save(record) => {
                save_record(state, &record)?;
            }
            PendingChange::Delete(key) => {
                delete(state, &key)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn save(
    state: &mut SessionState,
    records: &[EntityRecord],
    reload: Option<&[String]>,
) -> Result<(Vec<Vec<RowValues>>, Option<Vec<Option<CustomDbRow>>>), SqlSessionError> {
    flush(state)?;
    let mut keys = Vec::with_capacity(records.len());
    for record in records {
        keys.push(save_record(state, record)?);
    }
    let rows = match reload {
        Some(select) => {
            let mut rows = Vec::with_capacity(records.len());
            for (record, key) in records.iter().zip(&keys) {
                let lookup = KeyLookup {
                    key: RecordKey {
                        key: key.clone(),
                        ..record.key.clone()
                    },
                    select: select.to_vec(),
                    populate_existing: true,
                    lock: None,
                };
                rows.push(get(state, &lookup)?);
            }
            Some(rows)
        }
        None => None,
    };
    Ok((keys, rows))
}

pub(crate) fn apply(state: &mut SessionState, op: Op) -> Result<OpOutput, SqlSessionError> {
    match op {
        Op::Execute(stmt) => execute(state, &stmt).map(OpOutput::Rows),
        Op::Get(lookup) => get(state, &lookup).map(OpOutput::Row),
        Op::Save { records, reload } => {
            let (keys, rows) = save(state, &records, reload.as_deref())?;
            Ok(OpOutput::Saved { keys, rows })
        }
        Op::Delete(key) => {
            flush(state)?;
            delete(state, &key).map(OpOutput::Done)
        }
        Op::Flush => flush(state).map(|()| OpOutput::Done(0)),
    }
}

pub(crate) fn commit(state: &mut SessionState) -> Result<(), SqlSessionError> {
    flush(state)?;
    if state.in_transaction {
        state.blocking_conn()?.commit()?;
        state.in_transaction = false;
        debug!(session = state.id(), "committed");
    }
    state.expire();
    Ok(())
}

pub(crate) fn rollback(state: &mut SessionState) -> Result<(), SqlSessionError> {
    state.pending.clear();
    state.expire();
    if state.in_transaction {
        state.blocking_conn()?.rollback()?;
        state.in_transaction = false;
        debug!(session = state.id(), "rolled back");
    }
    Ok(())
}

pub(crate) fn finish(state: &mut SessionState, kind: Finish) -> Result<(), SqlSessionError> {
    match kind {
        Finish::Commit => commit(state),
        Finish::Rollback => rollback(state),
        Finish::Close => {
            let result = rollback(state);
            state.release();
            result
        }
    }
}

fn rollback_quietly(state: &mut SessionState) {
    if let Err(e) = rollback(state) {
        warn!(session = state.id(), error = %e, "rollback after failure also failed");
    }
}

/// Apply the commit/rollback half of `policy` to a finished call.
fn settle<T>(
    state: &mut SessionState,
    policy: CallPolicy,
    outcome: Result<T, SqlSessionError>,
    token: &CancellationToken,
) -> Result<T, SqlSessionError> {
    match outcome {
        Ok(value) if policy.commit_on_success() => {
            if token.is_cancelled() {
                rollback_quietly(state);
                return Err(SqlSessionError::Dispatch(
                    "caller went away before commit, rolled back".into(),
                ));
            }
            match commit(state) {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback_quietly(state);
                    Err(e)
                }
            }
        }
        Ok(value) => Ok(value),
        Err(e) => {
            if policy.rollback_on_error() {
                rollback_quietly(state);
            }
            Err(e)
        }
    }
}

/// Run one shortcut call on the worker pool.
pub(crate) async fn call<T, P>(session: &Session, op: Op, policy: CallPolicy, post: P) -> Result<T, SqlSessionError>
where
    P: FnOnce(OpOutput) -> Result<T, SqlSessionError> + Send + 'static,
    T: Send + 'static,
{
    let guard = session.lock(true).await?;
    let policy = policy.with_staged_writes(!guard.pending.is_empty());
    dispatch::run_in_pool_cancellable(move |token| {
        let mut guard = guard;
        let state = &mut *guard;
        let outcome = if token.is_cancelled() {
            Err(SqlSessionError::Dispatch(
                "caller went away before the call started".into(),
            ))
        } else {
            apply(state, op).and_then(post)
        };
        conclude(state, policy, outcome, token)
    })
    .await
}

/// `settle`, then close the session if the call owns it.
pub(crate) fn conclude<T>(
    state: &mut SessionState,
    policy: CallPolicy,
    outcome: Result<T, SqlSessionError>,
    token: &CancellationToken,
) -> Result<T, SqlSessionError> {
    let result = settle(state, policy, outcome, token);
    if policy.close_after()
        && let Err(e) = finish(state, Finish::Close)
    {
        warn!(session = state.id(), error = %e, "closing call session failed");
    }
    result
}
