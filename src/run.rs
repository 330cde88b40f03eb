//! The `run` escape hatch: caller code with direct access to the resolved session.

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;

use crate::dispatch;
use crate::entity::{Entity, EntityRecord, GetOptions, KeyLookup, KeyValues, RecordKey};
use crate::error::SqlSessionError;
use crate::registry;
use crate::resolver::Resolved;
use crate::results::ResultSet;
use crate::session::{CallPolicy, Op, OpOutput, SessionState, blocking, nonblocking};
use crate::statement::Statement;
use crate::types::{EngineMode, RowValues};

/// Handle passed to a `Database::run` closure.
///
/// Every method runs on the resolved session without committing; the surrounding
/// `run` call commits or rolls back once the closure finishes. On blocking engines
/// the closure itself runs on a worker thread, so the futures it awaits complete
/// without yielding to the caller's scheduler.
pub struct RunContext<'c> {
    state: &'c mut SessionState,
    mode: EngineMode,
}

impl<'c> RunContext<'c> {
    fn new(state: &'c mut SessionState, mode: EngineMode) -> Self {
        Self { state, mode }
    }

    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.state.id()
    }

    async fn apply(&mut self, op: Op) -> Result<OpOutput, SqlSessionError> {
        match self.mode {
            EngineMode::Blocking => blocking::apply(self.state, op),
            EngineMode::Async => nonblocking::apply(self.state, op).await,
        }
    }

    /// # Errors
    /// Returns the store error unchanged.
    pub async fn execute(&mut self, stmt: impl Into<Statement>) -> Result<ResultSet, SqlSessionError> {
        self.apply(Op::Execute(stmt.into())).await?.into_rows()
    }

    /// # Errors
    /// Returns the store error unchanged.
    pub async fn scalar(&mut self, stmt: impl Into<Statement>) -> Result<Option<RowValues>, SqlSessionError> {
        Ok(self.execute(stmt).await?.scalar())
    }

    /// # Errors
    /// Returns the store error unchanged.
    pub async fn scalars(&mut self, stmt: impl Into<Statement>) -> Result<Vec<RowValues>, SqlSessionError> {
        Ok(self.execute(stmt).await?.scalars())
    }

    /// # Errors
    /// Returns the store error, or `SqlSessionError::Entity` if the row does not map.
    pub async fn get<E: Entity>(
        &mut self,
        key: impl Into<KeyValues>,
        options: GetOptions,
    ) -> Result<Option<E>, SqlSessionError> {
        let lookup = KeyLookup::new::<E>(key.into().0, &options)?;
        self.apply(Op::Get(lookup))
            .await?
            .into_row()?
            .as_ref()
            .map(E::from_row)
            .transpose()
    }

    /// Insert or update one entity, storing a generated key on it.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn save<E: Entity>(&mut self, entity: &mut E) -> Result<(), SqlSessionError> {
        let record = EntityRecord::from_entity(entity)?;
        let (keys, _) = self
            .apply(Op::Save {
                records: vec![record],
                reload: None,
            })
            .await?
            .into_saved()?;
        if let Some(key) = keys.first() {
            entity.assign_key(key);
        }
        Ok(())
    }

    /// Delete one entity by key, returning the number of rows removed.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn delete<E: Entity>(&mut self, entity: &E) -> Result<usize, SqlSessionError> {
        let key = RecordKey::of::<E>(entity.primary_key())?;
        self.apply(Op::Delete(key)).await?.into_count()
    }

    /// # Errors
    /// Returns the store error unchanged.
    pub async fn flush(&mut self) -> Result<(), SqlSessionError> {
        self.apply(Op::Flush).await.map(|_| ())
    }

    /// The raw rusqlite connection, on blocking `SQLite` engines.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Unimplemented` for other engines.
    #[cfg(feature = "sqlite")]
    pub fn sqlite(&mut self) -> Result<&mut rusqlite::Connection, SqlSessionError> {
        if self.mode != EngineMode::Blocking {
            return Err(SqlSessionError::Unimplemented(
                "raw sqlite access needs a blocking engine".into(),
            ));
        }
        self.state.blocking_conn()?.raw_sqlite().ok_or_else(|| {
            SqlSessionError::Unimplemented("connection is not rusqlite backed".into())
        })
    }
}

pub(crate) async fn run<T, F>(resolved: Resolved, policy: CallPolicy, f: F) -> Result<T, SqlSessionError>
where
    F: for<'c> FnOnce(RunContext<'c>) -> BoxFuture<'c, Result<T, SqlSessionError>> + Send + 'static,
    T: Send + 'static,
{
    let mode = resolved.session.mode();
    let session_id = resolved.session.id();
    let mut guard = resolved.session.lock(true).await?;
    let policy = policy.with_staged_writes(!guard.pending.is_empty());
    // Calls from inside the closure that resolve back to this session fail fast
    // instead of waiting on the lock held here.
    match mode {
        EngineMode::Blocking => {
            let handle = Handle::current();
            dispatch::run_in_pool_cancellable(move |token| {
                let state = &mut *guard;
                let outcome = if token.is_cancelled() {
                    Err(SqlSessionError::Dispatch(
                        "caller went away before the call started".into(),
                    ))
                } else {
                    handle.block_on(registry::holding(session_id, f(RunContext::new(state, mode))))
                };
                blocking::conclude(state, policy, outcome, token)
            })
            .await
        }
        EngineMode::Async => {
            let outcome = registry::holding(session_id, f(RunContext::new(&mut guard, mode))).await;
            nonblocking::conclude(&mut guard, policy, outcome).await
        }
    }
}

/// Raw rusqlite work inside the resolved session's transaction.
#[cfg(feature = "sqlite")]
pub(crate) async fn run_raw_sqlite<T, F>(resolved: Resolved, policy: CallPolicy, f: F) -> Result<T, SqlSessionError>
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, SqlSessionError> + Send + 'static,
    T: Send + 'static,
{
    if resolved.session.mode() != EngineMode::Blocking {
        return Err(SqlSessionError::Unimplemented(
            "run_blocking needs a blocking sqlite engine".into(),
        ));
    }
    let session_id = resolved.session.id();
    let guard = resolved.session.lock(true).await?;
    dispatch::run_in_pool_cancellable(move |token| {
        let mut guard = guard;
        let state = &mut *guard;
        let outcome = if token.is_cancelled() {
            Err(SqlSessionError::Dispatch(
                "caller went away before the call started".into(),
            ))
        } else {
            blocking::flush(state)
                .and_then(|()| blocking::ensure_transaction(state))
                .and_then(|()| {
                    let conn = state.blocking_conn()?.raw_sqlite().ok_or_else(|| {
                        SqlSessionError::Unimplemented("connection is not rusqlite backed".into())
                    })?;
                    registry::holding_sync(session_id, || f(conn))
                })
        };
        blocking::conclude(state, policy, outcome, token)
    })
    .await
}
