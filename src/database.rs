use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use serde::Deserialize;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineOptions, EngineUrl};
use crate::entity::{Entity, EntityRecord, GetOptions, KeyLookup, KeyValues, RecordKey};
use crate::error::SqlSessionError;
use crate::registry::{self, ScopeGuard, SessionBinding};
use crate::resolver::{self, Resolved};
use crate::results::ResultSet;
use crate::run::{self, RunContext};
use crate::session::{CallPolicy, Op, OpOutput, Session};
use crate::statement::Statement;
use crate::types::{EngineMode, RowValues};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// What calls use when they get no executor and no scope is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSession {
    /// A fresh session per call, committed and closed by that call.
    #[default]
    PerCall,
    /// One session for the whole process, created on first use and closed by
    /// `shutdown`. Calls commit it but never close it. Using it from two tasks
    /// at once interleaves their work in one transaction; avoid that.
    Shared,
    /// Fail with `SqlSessionError::NoSession`.
    Disabled,
}

/// Construction options for `Database::create`.
///
/// ```rust
/// use sql_session::prelude::*;
///
/// let opts: DatabaseOptions = serde_json::from_str(
///     r#"{ "engine": { "max_connections": 4 }, "default_session": "disabled" }"#,
/// )
/// .unwrap();
/// assert_eq!(opts.default_session, DefaultSession::Disabled);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    pub engine: EngineOptions,
    pub default_session: DefaultSession,
}

impl DatabaseOptions {
    #[must_use]
    pub fn engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    #[must_use]
    pub fn default_session(mut self, default_session: DefaultSession) -> Self {
        self.default_session = default_session;
        self
    }
}

/// Per-call options for the shortcut methods.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Run on this session. The call then never commits, rolls back or closes it.
    pub executor: Option<Session>,
    /// Commit an owned session after success. Read-only statements never commit.
    pub commit: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            executor: None,
            commit: true,
        }
    }
}

impl CallOptions {
    #[must_use]
    pub fn executor(mut self, session: &Session) -> Self {
        self.executor = Some(session.clone());
        self
    }

    #[must_use]
    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }
}

/// Options for `Database::save`.
#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub executor: Option<Session>,
    pub commit: bool,
    /// Reload every saved entity so server-side defaults show up on it.
    pub refresh: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            executor: None,
            commit: true,
            refresh: false,
        }
    }
}

impl SaveOptions {
    #[must_use]
    pub fn executor(mut self, session: &Session) -> Self {
        self.executor = Some(session.clone());
        self
    }

    #[must_use]
    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

pub(crate) struct DatabaseInner {
    pub(crate) id: u64,
    pub(crate) engine: Engine,
    pub(crate) default_session: DefaultSession,
    pub(crate) shared: OnceLock<Session>,
}

/// The shortcut surface over one engine.
///
/// Every method has the same signature and commit semantics whether the engine
/// is blocking (`SQLite`) or async (Postgres). Each call runs on exactly one
/// session: the `executor` in its options, else the session bound to the current
/// context, else the configured default.
///
/// ```rust,no_run
/// use sql_session::prelude::*;
///
/// # async fn demo() -> Result<(), SqlSessionError> {
/// let db = Database::create("sqlite:///tmp/app.db", DatabaseOptions::default()).await?;
/// db.execute(
///     "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)",
///     CallOptions::default(),
/// )
/// .await?;
/// let count = db
///     .scalar("SELECT count(*) FROM users", CallOptions::default())
///     .await?;
/// # let _ = count;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("engine", &self.inner.engine)
            .field("default_session", &self.inner.default_session)
            .finish()
    }
}

impl Database {
    /// Build an engine from `url` and wrap it.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ConfigError` for a bad URL, or the driver error if
    /// the first connection fails.
    pub async fn create(url: &str, options: DatabaseOptions) -> Result<Self, SqlSessionError> {
        let url = EngineUrl::parse(url)?;
        let engine = Engine::connect(&url, &options.engine).await?;
        Ok(Self::from_engine(engine, options.default_session))
    }

    #[must_use]
    pub fn from_engine(engine: Engine, default_session: DefaultSession) -> Self {
        let id = NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(database = id, mode = ?engine.mode(), "database ready");
        Self {
            inner: Arc::new(DatabaseInner {
                id,
                engine,
                default_session,
                shared: OnceLock::new(),
            }),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    #[must_use]
    pub fn mode(&self) -> EngineMode {
        self.inner.engine.mode()
    }

    /// A new, unbound session the caller owns.
    #[must_use]
    pub fn new_session(&self) -> Session {
        Session::new(self.inner.engine.clone())
    }

    /// The session bound to the current context, if a scope bound one.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        match registry::lookup(self.inner.id) {
            Some(SessionBinding::Session(session)) => Some(session),
            _ => None,
        }
    }

    /// Whether any binding for this database is in effect here.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        registry::lookup(self.inner.id).is_some()
    }

    /// The session a call without an executor would use right now.
    ///
    /// For the per-call default this is a new session that the caller owns.
    ///
    /// # Errors
    /// Returns `SqlSessionError::NoSession` when nothing is bound and the default
    /// is disabled.
    pub fn current(&self) -> Result<Session, SqlSessionError> {
        resolver::resolve(&self.inner, None).map(|resolved| resolved.session)
    }

    /// The shared default session, when configured.
    #[must_use]
    pub fn default_session(&self) -> Option<Session> {
        (self.inner.default_session == DefaultSession::Shared).then(|| {
            self.inner
                .shared
                .get_or_init(|| self.new_session())
                .clone()
        })
    }

    /// Close the shared session, if any, and stop the engine handing out connections.
    ///
    /// # Errors
    /// Returns the store error from closing the shared session; the engine is shut
    /// down regardless.
    pub async fn shutdown(&self) -> Result<(), SqlSessionError> {
        let result = match self.inner.shared.get() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.inner.engine.shutdown();
        result
    }

    async fn call<T, P>(&self, executor: Option<&Session>, commit: bool, op: Op, post: P) -> Result<T, SqlSessionError>
    where
        P: FnOnce(OpOutput) -> Result<T, SqlSessionError> + Send + 'static,
        T: Send + 'static,
    {
        let Resolved { session, ownership } = resolver::resolve(&self.inner, executor)?;
        let policy = CallPolicy::new(ownership, commit, op.is_read_only());
        session.call(op, policy, post).await
    }

    /// Run a statement. Owned sessions commit afterwards unless the statement is
    /// read-only or `commit` is off.
    ///
    /// # Errors
    /// Returns the store error unchanged, after rolling back an owned session.
    pub async fn execute(
        &self,
        stmt: impl Into<Statement>,
        options: CallOptions,
    ) -> Result<ResultSet, SqlSessionError> {
        self.execute_with(stmt, options, Ok).await
    }

    /// `execute`, passing the result through `transform` before the session is
    /// committed and closed.
    ///
    /// # Errors
    /// Returns the store error or the transform's error; either rolls back an owned
    /// session.
    pub async fn execute_with<T, F>(
        &self,
        stmt: impl Into<Statement>,
        options: CallOptions,
        transform: F,
    ) -> Result<T, SqlSessionError>
    where
        F: FnOnce(ResultSet) -> Result<T, SqlSessionError> + Send + 'static,
        T: Send + 'static,
    {
        self.call(
            options.executor.as_ref(),
            options.commit,
            Op::Execute(stmt.into()),
            move |out| transform(out.into_rows()?),
        )
        .await
    }

    /// First column of the first row.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn scalar(
        &self,
        stmt: impl Into<Statement>,
        options: CallOptions,
    ) -> Result<Option<RowValues>, SqlSessionError> {
        self.execute_with(stmt, options, |rs| Ok(rs.scalar())).await
    }

    /// First column of every row, fully read.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn scalars(
        &self,
        stmt: impl Into<Statement>,
        options: CallOptions,
    ) -> Result<Vec<RowValues>, SqlSessionError> {
        self.execute_with(stmt, options, |rs| Ok(rs.scalars())).await
    }

    /// Look an entity up by primary key.
    ///
    /// # Errors
    /// Returns the store error, or `SqlSessionError::Entity` if the row does not map.
    pub async fn get<E: Entity>(&self, key: impl Into<KeyValues>) -> Result<Option<E>, SqlSessionError> {
        self.get_with(key, GetOptions::default()).await
    }

    /// `get` with identity-map, lock and loading options.
    ///
    /// # Errors
    /// Returns the store error, or `SqlSessionError::Entity` if the row does not map.
    pub async fn get_with<E: Entity>(
        &self,
        key: impl Into<KeyValues>,
        options: GetOptions,
    ) -> Result<Option<E>, SqlSessionError> {
        let lookup = KeyLookup::new::<E>(key.into().0, &options)?;
        self.call(options.executor.as_ref(), true, Op::Get(lookup), |out| {
            out.into_row()?.as_ref().map(E::from_row).transpose()
        })
        .await
    }

    /// Delete an entity by its key.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Entity` for an entity without a key, otherwise the
    /// store error.
    pub async fn delete<E: Entity>(&self, entity: &E, options: CallOptions) -> Result<(), SqlSessionError> {
        let key = RecordKey::of::<E>(entity.primary_key())?;
        if !key.is_populated() {
            return Err(SqlSessionError::Entity(format!(
                "cannot delete a {} row without a key",
                E::TABLE
            )));
        }
        self.call(options.executor.as_ref(), options.commit, Op::Delete(key), |out| {
            out.into_count().map(|_| ())
        })
        .await
    }

    /// Insert or update each entity and hand them back with their keys.
    ///
    /// An entity with a full key is updated, or inserted if no row has that key.
    /// One without a key is inserted and receives the generated key. With
    /// `refresh`, each entity is rebuilt from its stored row so server defaults
    /// are visible.
    ///
    /// # Errors
    /// Returns the store error unchanged, after rolling back an owned session.
    pub async fn save<E: Entity>(&self, entities: Vec<E>, options: SaveOptions) -> Result<Vec<E>, SqlSessionError> {
        let records = entities
            .iter()
            .map(EntityRecord::from_entity)
            .collect::<Result<Vec<_>, _>>()?;
        let reload = options.refresh.then(|| {
            let mut select: Vec<String> = E::PRIMARY_KEY.iter().map(|c| (*c).to_string()).collect();
            select.extend(E::COLUMNS.iter().map(|c| (*c).to_string()));
            select
        });
        let op = Op::Save { records, reload };

        self.call(options.executor.as_ref(), options.commit, op, move |out| {
            let (keys, rows) = out.into_saved()?;
            match rows {
                Some(rows) => rows
                    .into_iter()
                    .map(|row| {
                        row.ok_or_else(|| {
                            SqlSessionError::Entity(format!("saved {} row vanished before reload", E::TABLE))
                        })
                        .and_then(|row| E::from_row(&row))
                    })
                    .collect(),
                None => {
                    let mut entities = entities;
                    for (entity, key) in entities.iter_mut().zip(&keys) {
                        entity.assign_key(key);
                    }
                    Ok(entities)
                }
            }
        })
        .await
    }

    /// Reload an entity from the store, bypassing the identity map.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Entity` when the row no longer exists.
    pub async fn refresh<E: Entity>(&self, entity: &E, options: GetOptions) -> Result<E, SqlSessionError> {
        let options = options.populate_existing(true);
        let lookup = KeyLookup::new::<E>(entity.primary_key(), &options)?;
        self.call(options.executor.as_ref(), true, Op::Get(lookup), |out| {
            let row = out.into_row()?.ok_or_else(|| {
                SqlSessionError::Entity(format!("{} row no longer exists", E::TABLE))
            })?;
            E::from_row(&row)
        })
        .await
    }

    /// Write the resolved session's staged changes, committing an owned session.
    ///
    /// # Errors
    /// Returns the store error unchanged.
    pub async fn flush(&self, options: CallOptions) -> Result<(), SqlSessionError> {
        self.call(options.executor.as_ref(), options.commit, Op::Flush, |_| Ok(()))
            .await
    }

    /// Run caller code on the resolved session, then commit or roll back like any
    /// other mutation.
    ///
    /// ```rust,no_run
    /// use sql_session::prelude::*;
    ///
    /// # async fn demo(db: Database) -> Result<(), SqlSessionError> {
    /// let total = db
    ///     .run(
    ///         |mut ctx| {
    ///             Box::pin(async move {
    ///                 ctx.execute(Statement::new("UPDATE counters SET n = n + 1")).await?;
    ///                 ctx.scalar("SELECT sum(n) FROM counters").await
    ///             })
    ///         },
    ///         CallOptions::default(),
    ///     )
    ///     .await?;
    /// # let _ = total;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns the closure's error after rolling back an owned session.
    pub async fn run<T, F>(&self, f: F, options: CallOptions) -> Result<T, SqlSessionError>
    where
        F: for<'c> FnOnce(RunContext<'c>) -> BoxFuture<'c, Result<T, SqlSessionError>> + Send + 'static,
        T: Send + 'static,
    {
        let resolved = resolver::resolve(&self.inner, options.executor.as_ref())?;
        let policy = CallPolicy::new(resolved.ownership, options.commit, false);
        run::run(resolved, policy, f).await
    }

    /// Run raw rusqlite work on the resolved session's connection, inside its
    /// transaction, on the worker pool.
    ///
    /// # Errors
    /// Returns `SqlSessionError::Unimplemented` on engines that are not rusqlite
    /// backed, otherwise the closure's error after rolling back an owned session.
    #[cfg(feature = "sqlite")]
    pub async fn run_blocking<T, F>(&self, f: F, options: CallOptions) -> Result<T, SqlSessionError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, SqlSessionError> + Send + 'static,
        T: Send + 'static,
    {
        let resolved = resolver::resolve(&self.inner, options.executor.as_ref())?;
        let policy = CallPolicy::new(resolved.ownership, options.commit, false);
        run::run_raw_sqlite(resolved, policy, f).await
    }

    /// Run `f` inside a fresh session bound to this task.
    ///
    /// Shortcut calls inside use that session and leave its transaction alone; the
    /// scope commits when `f` returns `Ok`, rolls back on `Err` or panic, and
    /// always closes the session. The previous binding is restored on every path.
    ///
    /// # Errors
    /// Returns `f`'s error, or the store error from the final commit.
    pub async fn scope<T, F, Fut>(&self, f: F) -> Result<T, SqlSessionError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, SqlSessionError>>,
    {
        let session = self.new_session();
        let body = self.bind(&session, f(session.clone()));
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => {
                let committed = session.commit().await;
                close_quietly(&session).await;
                committed.map(|()| value)
            }
            Ok(Err(e)) => {
                close_quietly(&session).await;
                Err(e)
            }
            Err(panic) => {
                close_quietly(&session).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Run `fut` with `session` bound for this database. Calls inside resolve to
    /// it and never commit or close it.
    pub async fn bind<F: Future>(&self, session: &Session, fut: F) -> F::Output {
        self.with_binding(SessionBinding::Session(session.clone()), fut)
            .await
    }

    /// Run `fut` under an arbitrary binding, e.g. `SessionBinding::PerCall` to
    /// shadow an outer scope.
    pub async fn with_binding<F: Future>(&self, binding: SessionBinding, fut: F) -> F::Output {
        registry::scoped(self.inner.id, binding, fut).await
    }

    /// Bind `session` on this thread until the guard drops.
    ///
    /// For code that owns its thread: a plain thread, or the future handed to
    /// `block_on`. Tasks spawned on the runtime never see the binding, and a
    /// `bind` inside the guard's lifetime shadows it.
    ///
    /// # Errors
    /// Returns `SqlSessionError::ExecutionError` when called from inside a tokio
    /// task, where `bind` or `scope` must be used instead.
    pub fn enter(&self, session: &Session) -> Result<ScopeGuard, SqlSessionError> {
        registry::enter(self.inner.id, SessionBinding::Session(session.clone()))
    }
}

/// Close errors after the scope already has its answer are only logged.
pub(crate) async fn close_quietly(session: &Session) {
    if let Err(e) = session.close().await {
        warn!(session = session.id(), error = %e, "closing scoped session failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_load_from_config_text() {
        let opts: DatabaseOptions = serde_json::from_str(
            r#"{
                "engine": { "max_connections": 3, "translate_placeholders": true, "wal": false },
                "default_session": "shared"
            }"#,
        )
        .unwrap();
        assert_eq!(opts.engine.max_connections, 3);
        assert!(opts.engine.translate_placeholders);
        assert!(!opts.engine.wal);
        assert_eq!(opts.engine.busy_timeout, EngineOptions::default().busy_timeout);
        assert_eq!(opts.default_session, DefaultSession::Shared);

        let empty: DatabaseOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.default_session, DefaultSession::PerCall);
    }

    #[test]
    fn call_options_default_to_committing() {
        assert!(CallOptions::default().commit);
        assert!(CallOptions::default().executor.is_none());
        let save = SaveOptions::default().refresh(true).commit(false);
        assert!(save.refresh && !save.commit);
    }
}
