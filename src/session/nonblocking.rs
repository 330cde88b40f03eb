//! Session work for engines with an async driver. Runs on the caller's task and
//! yields at every driver call.

use tracing::{debug, warn};

use super::sql::{SavePlan, returned_key};
use super::{CallPolicy, Finish, Op, OpOutput, PendingChange, Session, SessionState};
use crate::entity::{EntityRecord, KeyLookup, RecordKey};
use crate::error::SqlSessionError;
use crate::results::{CustomDbRow, ResultSet};
use crate::statement::Statement;
use crate::types::RowValues;

async fn ensure_transaction(state: &mut SessionState) -> Result<(), SqlSessionError> {
    if !state.in_transaction {
        // Set first: if this future is dropped mid-BEGIN, the drop-time rollback
        // still runs.
        state.in_transaction = true;
        let begun = match state.async_conn() {
            Ok(conn) => conn.begin().await,
            Err(e) => Err(e),
        };
        if let Err(e) = begun {
            state.in_transaction = false;
            return Err(e);
        }
        debug!(session = state.id(), "transaction started");
    }
    Ok(())
}

pub(crate) async fn execute(state: &mut SessionState, stmt: &Statement) -> Result<ResultSet, SqlSessionError> {
    flush(state).await?;
    if !stmt.is_read_only() {
        ensure_transaction(state).await?;
    }
    let sql = state.translate(stmt);
    state.async_conn()?.query(&sql, stmt.parameters()).await
}

pub(crate) async fn get(
    state: &mut SessionState,
    lookup: &KeyLookup,
) -> Result<Option<CustomDbRow>, SqlSessionError> {
    flush(state).await?;
    if !lookup.populate_existing
        && lookup.lock.is_none()
        && let Some(row) = state.identity.get(&lookup.key)
    {
        return Ok(Some(row.clone()));
    }
    if lookup.lock.is_some() {
        ensure_transaction(state).await?;
    }
    let (sql, params) = state.builder().select_by_key(lookup);
    let row = state.async_conn()?.query(&sql, &params).await?.into_first();
    match &row {
        Some(found) => state.identity.insert(&lookup.key, found.clone()),
        None => state.identity.forget(&lookup.key),
    }
    Ok(row)
}

async fn save_record(state: &mut SessionState, record: &EntityRecord) -> Result<Vec<RowValues>, SqlSessionError> {
    ensure_transaction(state).await?;
    let plan = state.builder().save_plan(record);
    let conn = state.async_conn()?;
    let key = match plan {
        SavePlan::Upsert {
            update,
            exists,
            insert,
        } => {
            let matched = match update {
                Some((sql, params)) => conn.query(&sql, &params).await?.rows_affected > 0,
                None => !conn.query(&exists.0, &exists.1).await?.is_empty(),
            };
            if !matched {
                conn.query(&insert.0, &insert.1).await?;
            }
            record.key.key.clone()
        }
        SavePlan::Insert((sql, params)) => returned_key(record, &conn.query(&sql, &params).await?)?,
    };
    state.identity.forget(&record.key);
    Ok(key)
}

async fn delete(state: &mut SessionState, key: &RecordKey) -> Result<usize, SqlSessionError> {
    ensure_transaction(state).await?;
    let (sql, params) = state.builder().delete(key);
    let changed = state.async_conn()?.query(&sql, &params).await?.rows_affected;
    state.identity.forget(key);
    Ok(changed)
}

pub(crate) async fn flush(state: &mut SessionState) -> Result<(), SqlSessionError> {
    if state.pending.is_empty() {
        return Ok(());
    }
    let pending = std::mem::take(&mut state.pending);
    debug!(session = state.id(), changes = pending.len(), "flushing");
    for change in pending {
        match change {
            PendingChange::Save(record) => {
                save_record(state, &record).await?;
            }
            PendingChange::Delete(key) => {
                delete(state, &key).await?;
            }
        }
    }
    Ok(())
}

pub(crate) async fn save(
    state: &mut SessionState,
    records: &[EntityRecord],
    reload: Option<&[String]>,
) -> Result<(Vec<Vec<RowValues>>, Option<Vec<Option<CustomDbRow>>>), SqlSessionError> {
    flush(state).await?;
    let mut keys = Vec::with_capacity(records.len());
    for record in records {
        keys.push(save_record(state, record).await?);
    }
    let Some(select) = reload else {
        return Ok((keys, None));
    };
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
        rows.push(get(state, &lookup).await?);
    }
    Ok((keys, Some(rows)))
}

pub(crate) async fn apply(state: &mut SessionState, op: Op) -> Result<OpOutput, SqlSessionError> {
    match op {
        Op::Execute(stmt) => execute(state, &stmt).await.map(OpOutput::Rows),
        Op::Get(lookup) => get(state, &lookup).await.map(OpOutput::Row),
        Op::Save { records, reload } => {
            let (keys, rows) = save(state, &records, reload.as_deref()).await?;
            Ok(OpOutput::Saved { keys, rows })
        }
        Op::Delete(key) => {
            flush(state).await?;
            delete(state, &key).await.map(OpOutput::Done)
        }
        Op::Flush => flush(state).await.map(|()| OpOutput::Done(0)),
    }
}

pub(crate) async fn commit(state: &mut SessionState) -> Result<(), SqlSessionError> {
    flush(state).await?;
    if state.in_transaction {
        state.async_conn()?.commit().await?;
        state.in_transaction = false;
        debug!(session = state.id(), "committed");
    }
    state.expire();
    Ok(())
}

pub(crate) async fn rollback(state: &mut SessionState) -> Result<(), SqlSessionError> {
    state.pending.clear();
    state.expire();
    if state.in_transaction {
        state.async_conn()?.rollback().await?;
        state.in_transaction = false;
        debug!(session = state.id(), "rolled back");
    }
    Ok(())
}

pub(crate) async fn finish(state: &mut SessionState, kind: Finish) -> Result<(), SqlSessionError> {
    match kind {
        Finish::Commit => commit(state).await,
        Finish::Rollback => rollback(state).await,
        Finish::Close => {
            let result = rollback(state).await;
            state.release();
            result
        }
    }
}

async fn rollback_quietly(state: &mut SessionState) {
    if let Err(e) = rollback(state).await {
        warn!(session = state.id(), error = %e, "rollback after failure also failed");
    }
}

async fn settle<T>(
    state: &mut SessionState,
    policy: CallPolicy,
    outcome: Result<T, SqlSessionError>,
) -> Result<T, SqlSessionError> {
    match outcome {
        Ok(value) if policy.commit_on_success() => match commit(state).await {
            Ok(()) => Ok(value),
            Err(e) => {
                rollback_quietly(state).await;
                Err(e)
            }
        },
        Ok(value) => Ok(value),
        Err(e) => {
            if policy.rollback_on_error() {
                rollback_quietly(state).await;
            }
            Err(e)
        }
    }
}

/// Run one shortcut call on the caller's task. Dropping the returned future drops
/// the in-flight driver call; an abandoned transaction is rolled back when its
/// session goes away.
pub(crate) async fn call<T, P>(session: &Session, op: Op, policy: CallPolicy, post: P) -> Result<T, SqlSessionError>
where
    P: FnOnce(OpOutput) -> Result<T, SqlSessionError> + Send + 'static,
    T: Send + 'static,
{
    let mut guard = session.lock(true).await?;
    let policy = policy.with_staged_writes(!guard.pending.is_empty());
    let outcome = match apply(&mut guard, op).await {
        Ok(output) => post(output),
        Err(e) => Err(e),
    };
    conclude(&mut guard, policy, outcome).await
}

/// `settle`, then close the session if the call owns it.
pub(crate) async fn conclude<T>(
    state: &mut SessionState,
    policy: CallPolicy,
    outcome: Result<T, SqlSessionError>,
) -> Result<T, SqlSessionError> {
    let result = settle(state, policy, outcome).await;
    if policy.close_after()
        && let Err(e) = finish(state, Finish::Close).await
    {
        warn!(session = state.id(), error = %e, "closing call session failed");
    }
    result
}
