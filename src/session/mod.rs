//! Units of work over one pooled connection.
//!
//! A `Session` stages entity changes, runs statements inside a lazily started
//! transaction and remembers rows it has already loaded. The same session type
//! serves both engine modes; `blocking` and `nonblocking` hold the two ways of
//! driving its state.

pub(crate) mod blocking;
mod identity;
pub(crate) mod nonblocking;
mod policy;
pub(crate) mod sql;

pub use policy::Ownership;
pub(crate) use policy::CallPolicy;

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::dispatch;
use crate::engine::{AsyncConnection, BlockingConnection, Connection, Engine};
use crate::entity::{Entity, EntityRecord, GetOptions, KeyLookup, KeyValues, RecordKey};
use crate::error::SqlSessionError;
use crate::registry;
use crate::results::{CustomDbRow, ResultSet};
use crate::statement::Statement;
use crate::translation::translate_placeholders;
use crate::types::{EngineMode, RowValues};

use identity::IdentityMap;
use sql::SqlBuilder;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A staged change, written by the next flush.
#[derive(Debug)]
pub(crate) enum PendingChange {
    Save(EntityRecord),
    Delete(RecordKey),
}

/// One unit of work the call paths know how to run.
#[derive(Debug)]
pub(crate) enum Op {
    Execute(Statement),
    Get(KeyLookup),
    Save {
        records: Vec<EntityRecord>,
        /// Columns to read back after writing, for `refresh`.
        reload: Option<Vec<String>>,
    },
    Delete(RecordKey),
    Flush,
}

impl Op {
    pub(crate) fn is_read_only(&self) -> bool {
        match self {
            Op::Execute(stmt) => stmt.is_read_only(),
            Op::Get(_) => true,
            Op::Save { .. } | Op::Delete(_) | Op::Flush => false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum OpOutput {
    Rows(ResultSet),
    Row(Option<CustomDbRow>),
    Saved {
        keys: Vec<Vec<RowValues>>,
        rows: Option<Vec<Option<CustomDbRow>>>,
    },
    Done(usize),
}

fn mismatch(expected: &str, got: &OpOutput) -> SqlSessionError {
    SqlSessionError::ExecutionError(format!("expected {expected} output, got {got:?}"))
}

impl OpOutput {
    pub(crate) fn into_rows(self) -> Result<ResultSet, SqlSessionError> {
        match self {
            OpOutput::Rows(rs) => Ok(rs),
            other => Err(mismatch("rows", &other)),
        }
    }

    pub(crate) fn into_row(self) -> Result<Option<CustomDbRow>, SqlSessionError> {
        match self {
            OpOutput::Row(row) => Ok(row),
            other => Err(mismatch("row", &other)),
        }
    }

    pub(crate) fn into_saved(
        self,
    ) -> Result<(Vec<Vec<RowValues>>, Option<Vec<Option<CustomDbRow>>>), SqlSessionError> {
        match self {
            OpOutput::Saved { keys, rows } => Ok((keys, rows)),
            other => Err(mismatch("saved", &other)),
        }
    }

    pub(crate) fn into_count(self) -> Result<usize, SqlSessionError> {
        match self {
            OpOutput::Done(n) => Ok(n),
            other => Err(mismatch("count", &other)),
        }
    }
}

/// Mutable state of a session. Only ever touched through the session's mutex.
pub(crate) struct SessionState {
    id: u64,
    engine: Engine,
    conn: Option<Connection>,
    pub(crate) identity: IdentityMap,
    pub(crate) pending: Vec<PendingChange>,
    pub(crate) in_transaction: bool,
}

impl SessionState {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn builder(&self) -> SqlBuilder {
        SqlBuilder::new(self.engine.database_type())
    }

    /// Statement text in this engine's placeholder style, if translation applies.
    pub(crate) fn translate<'s>(&self, stmt: &'s Statement) -> Cow<'s, str> {
        let enabled = stmt
            .translation_mode()
            .resolve(self.engine.translate_placeholders());
        translate_placeholders(stmt.sql(), self.builder().style(), enabled)
    }

    pub(crate) fn blocking_conn(&mut self) -> Result<&mut dyn BlockingConnection, SqlSessionError> {
        match self.conn.as_mut() {
            Some(Connection::Blocking(conn)) => Ok(conn.as_mut()),
            Some(Connection::Async(_)) => Err(SqlSessionError::ExecutionError(
                "session holds an async connection".into(),
            )),
            None => Err(SqlSessionError::ConnectionError(
                "session has no connection".into(),
            )),
        }
    }

    pub(crate) fn async_conn(&mut self) -> Result<&mut dyn AsyncConnection, SqlSessionError> {
        match self.conn.as_mut() {
            Some(Connection::Async(conn)) => Ok(conn.as_mut()),
            Some(Connection::Blocking(_)) => Err(SqlSessionError::ExecutionError(
                "session holds a blocking connection".into(),
            )),
            None => Err(SqlSessionError::ConnectionError(
                "session has no connection".into(),
            )),
        }
    }

    pub(crate) fn has_connection(&self) -> bool {
        self.conn.is_some()
    }

    /// Forget every loaded row.
    pub(crate) fn expire(&mut self) {
        if self.identity.len() > 0 {
            debug!(session = self.id, rows = self.identity.len(), "identity map expired");
        }
        self.identity.clear();
    }

    /// Hand the connection back to its pool. A connection whose rollback failed
    /// still has its transaction open; the pool discards it rather than reuse it.
    pub(crate) fn release(&mut self) {
        self.in_transaction = false;
        if self.conn.take().is_some() {
            debug!(session = self.id, "connection released");
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!(session = self.id, "session dropped with an open transaction, rolling back");
        match conn {
            // Finish before the connection can be handed out again.
            Connection::Blocking(mut conn) => {
                if let Err(e) = conn.rollback() {
                    warn!(error = %e, "rollback on drop failed");
                }
            }
            Connection::Async(mut conn) => {
                if let Ok(handle) = Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(e) = conn.rollback().await {
                            warn!(error = %e, "rollback on drop failed");
                        }
                    });
                } else {
                    warn!("no runtime to roll back on; dropping connection");
                }
            }
        }
    }
}

/// Which way to end the session's current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finish {
    Commit,
    Rollback,
    Close,
}

struct SessionInner {
    id: u64,
    engine: Engine,
    state: Arc<Mutex<SessionState>>,
}

/// A unit of work: staged changes, one lazily acquired connection, a transaction
/// that starts with the first write, and an identity map of loaded rows.
///
/// Cloning is cheap and every clone is the same session. A session is not meant
/// for concurrent use: calls on one session queue behind each other, but
/// interleaving two logical tasks' work in one transaction is a caller error.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.engine.mode())
            .finish()
    }
}

impl Session {
    /// A new session on `engine`. No connection is taken until it is needed.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "session created");
        let state = SessionState {
            id,
            engine: engine.clone(),
            conn: None,
            identity: IdentityMap::default(),
            pending: Vec::new(),
            in_transaction: false,
        };
        Self {
            inner: Arc::new(SessionInner {
                id,
                engine,
                state: Arc::new(Mutex::new(state)),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.inner.engine.mode()
    }

    /// True when both handles are the same session.
    #[must_use]
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether a transaction is open. Waits for any call in flight on this session.
    pub async fn in_transaction(&self) -> bool {
        self.inner.state.lock().await.in_transaction
    }

    /// Lock the state without touching the connection.
    ///
    /// Refuses when a `run` closure on this task already holds the lock, since
    /// waiting for it would never finish.
    async fn lock_state(&self) -> Result<OwnedMutexGuard<SessionState>, SqlSessionError> {
        if registry::is_held(self.inner.id) {
            return Err(SqlSessionError::ExecutionError(format!(
                "session {} is held by the running `run` closure; use its RunContext",
                self.inner.id
            )));
        }
        Ok(Arc::clone(&self.inner.state).lock_owned().await)
    }

    async fn connect(&self, state: &mut SessionState) -> Result<(), SqlSessionError> {
        if state.conn.is_none() {
            state.conn = Some(self.inner.engine.acquire().await?);
            debug!(session = self.inner.id, "connection acquired");
        }
        Ok(())
    }

    /// Lock the state, taking a connection first when `connect` is set.
    pub(crate) async fn lock(&self, connect: bool) -> Result<OwnedMutexGuard<SessionState>, SqlSessionError> {
        let mut guard = self.lock_state().await?;
        if connect {
            self.connect(&mut guard).await?;
        }
        Ok(guard)
    }

    /// Run `op` under `policy` on whichever path this session's engine needs.
    pub(crate) async fn call<T, P>(&self, op: Op, policy: CallPolicy, post: P) -> Result<T, SqlSessionError>
    where
        P: FnOnce(OpOutput) -> Result<T, SqlSessionError> + Send + 'static,
        T: Send + 'static,
    {
        match self.mode() {
            EngineMode::Blocking => blocking::call(self, op, policy, post).await,
            EngineMode::Async => nonblocking::call(self, op, policy, post).await,
        }
    }

    async fn direct<T, P>(&self, op: Op, post: P) -> Result<T, SqlSessionError>
    where
        P: FnOnce(OpOutput) -> Result<T, SqlSessionError> + Send + 'static,
        T: Send + 'static,
    {
        let policy = CallPolicy::new(Ownership::Caller, false, op.is_read_only());
        self.call(op, policy, post).await
    }

    /// Run a statement inside this session. Writes open the transaction; nothing
    /// is committed.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn execute(&self, stmt: impl Into<Statement>) -> Result<ResultSet, SqlSessionError> {
        self.direct(Op::Execute(stmt.into()), OpOutput::into_rows).await
    }

    /// Look an entity up by key, serving repeats from the identity map.
    ///
    /// # Errors
    /// Returns the store error, or `SqlSessionError::Entity` if the row does not map.
    pub async fn get<E: Entity>(
        &self,
        key: impl Into<KeyValues>,
        options: GetOptions,
    ) -> Result<Option<E>, SqlSessionError> {
        let lookup = KeyLookup::new::<E>(key.into().0, &options)?;
        self.direct(Op::Get(lookup), |out| {
            out.into_row()?.as_ref().map(E::from_row).transpose()
        })
        .await
    }

    /// Stage an insert-or-update for the next flush.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Entity` when the entity's values do not match its columns.
    pub async fn add<E: Entity>(&self, entity: &E) -> Result<(), SqlSessionError> {
        let record = EntityRecord::from_entity(entity)?;
        let mut state = self.lock_state().await?;
        state.identity.forget(&record.key);
        state.pending.push(PendingChange::Save(record));
        Ok(())
    }

    /// Stage a delete for the next flush.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Entity` when the entity has no populated key.
    pub async fn mark_deleted<E: Entity>(&self, entity: &E) -> Result<(), SqlSessionError> {
        let key = RecordKey::of::<E>(entity.primary_key())?;
        if !key.is_populated() {
            return Err(SqlSessionError::Entity(format!(
                "cannot delete a {} row without a key",
                E::TABLE
            )));
        }
        let mut state = self.lock_state().await?;
        state.identity.forget(&key);
        state.pending.push(PendingChange::Delete(key));
        Ok(())
    }

    /// Write staged changes inside the transaction without committing.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn flush(&self) -> Result<(), SqlSessionError> {
        self.direct(Op::Flush, |_| Ok(())).await
    }

    /// Flush, commit and expire loaded rows.
    ///
    /// # Errors
    /// Returns the store error; the transaction stays open for a rollback.
    pub async fn commit(&self) -> Result<(), SqlSessionError> {
        self.finish(Finish::Commit).await
    }

    /// Drop staged changes and roll back.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn rollback(&self) -> Result<(), SqlSessionError> {
        self.finish(Finish::Rollback).await
    }

    /// Roll back anything open and return the connection to the pool. The session
    /// stays usable and takes a new connection on its next call.
    ///
    /// # Errors
    /// Returns the store error from the rollback; the connection is released anyway.
    pub async fn close(&self) -> Result<(), SqlSessionError> {
        self.finish(Finish::Close).await
    }

    pub(crate) async fn finish(&self, kind: Finish) -> Result<(), SqlSessionError> {
        let mut guard = self.lock_state().await?;
        if kind == Finish::Commit && !guard.pending.is_empty() {
            self.connect(&mut guard).await?;
        }
        if !guard.has_connection() {
            guard.pending.clear();
            guard.expire();
            return Ok(());
        }
        match self.mode() {
            EngineMode::Blocking => {
                dispatch::run_in_pool(move || {
                    let mut guard = guard;
                    blocking::finish(&mut guard, kind)
                })
                .await
            }
            EngineMode::Async => nonblocking::finish(&mut guard, kind).await,
        }
    }

    /// Run raw rusqlite work on this session's connection, on the worker pool.
    ///
    /// Runs inside the session's transaction if one is open.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Unimplemented` for engines that are not rusqlite
    /// backed, otherwise whatever `f` returns.
    #[cfg(feature = "sqlite")]
    pub async fn with_blocking_sqlite<F, R>(&self, f: F) -> Result<R, SqlSessionError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, SqlSessionError> + Send + 'static,
        R: Send + 'static,
    {
        if self.mode() != EngineMode::Blocking {
            return Err(SqlSessionError::Unimplemented(
                "with_blocking_sqlite needs a blocking sqlite engine".into(),
            ));
        }
        let session_id = self.inner.id;
        let guard = self.lock(true).await?;
        dispatch::run_in_pool(move || {
            let mut guard = guard;
            let conn = guard.blocking_conn()?.raw_sqlite().ok_or_else(|| {
                SqlSessionError::Unimplemented("connection is not rusqlite backed".into())
            })?;
            registry::holding_sync(session_id, || f(conn))
        })
        .await
    }
}
