#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sql_session::prelude::*;
use sql_session::sqlite::SqliteSource;
use sql_session::{AsyncConnection, BlockingConnection, Connection, ConnectionSource};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub city: Option<String>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            city: None,
        }
    }

    pub fn with_id(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            ..Self::new(name)
        }
    }
}

impl Entity for Team {
    const TABLE: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const COLUMNS: &'static [&'static str] = &["name", "city"];

    fn primary_key(&self) -> Vec<RowValues> {
        vec![self.id.into()]
    }

    fn values(&self) -> Vec<RowValues> {
        vec![self.name.clone().into(), self.city.clone().into()]
    }

    fn from_row(row: &CustomDbRow) -> Result<Self, SqlSessionError> {
        let name = row
            .get("name")
            .and_then(RowValues::as_text)
            .ok_or_else(|| SqlSessionError::Entity("teams.name missing".into()))?;
        Ok(Team {
            id: row.get("id").and_then(RowValues::as_int).copied(),
            name: name.to_string(),
            city: row.get("city").and_then(RowValues::as_text).map(str::to_string),
        })
    }

    fn assign_key(&mut self, key: &[RowValues]) {
        self.id = key.first().and_then(RowValues::as_int).copied();
    }
}

pub const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    city TEXT DEFAULT 'unknown'
)";

/// A fresh on-disk database URL. Keep the `TempDir` alive for the test's duration.
pub fn unique_db_url(tag: &str) -> Result<(TempDir, String), Box<dyn std::error::Error>> {
    let dir = tempfile::Builder::new().prefix(tag).tempdir()?;
    let path = dir.path().join(format!("{tag}.db"));
    Ok((dir, format!("sqlite://{}", path.display())))
}

/// Create the schema on a caller-owned session, so setup works under any default.
pub async fn create_schema(db: &Database) -> Result<(), SqlSessionError> {
    let session = db.new_session();
    db.execute(SCHEMA, CallOptions::default().executor(&session))
        .await?;
    session.commit().await?;
    session.close().await
}

pub async fn sqlite_db(
    tag: &str,
    default_session: DefaultSession,
) -> Result<(TempDir, Database), Box<dyn std::error::Error>> {
    let (dir, url) = unique_db_url(tag)?;
    let db = Database::create(
        &url,
        DatabaseOptions::default().default_session(default_session),
    )
    .await?;
    create_schema(&db).await?;
    Ok((dir, db))
}

pub async fn team_count(db: &Database) -> Result<i64, SqlSessionError> {
    let count = db
        .scalar("SELECT count(*) FROM teams", CallOptions::default())
        .await?;
    Ok(count.and_then(|v| v.as_int().copied()).unwrap_or(-1))
}

/// Counts what the session layer does to the connections it checks out.
#[derive(Debug, Default)]
pub struct Counters {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    /// While set, rollbacks report failure and leave the transaction open.
    pub fail_rollbacks: AtomicBool,
}

pub fn count(field: &AtomicUsize) -> usize {
    field.load(Ordering::SeqCst)
}

struct SpyConnection {
    inner: Box<dyn BlockingConnection>,
    counters: Arc<Counters>,
}

impl Drop for SpyConnection {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl BlockingConnection for SpyConnection {
    fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError> {
        self.inner.query(sql, params)
    }

    fn begin(&mut self) -> Result<(), SqlSessionError> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), SqlSessionError> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), SqlSessionError> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_rollbacks.load(Ordering::SeqCst) {
            return Err(SqlSessionError::ExecutionError("rollback refused".into()));
        }
        self.inner.rollback()
    }

    fn database_type(&self) -> DatabaseType {
        self.inner.database_type()
    }

    fn raw_sqlite(&mut self) -> Option<&mut rusqlite::Connection> {
        self.inner.raw_sqlite()
    }
}

/// Wraps a real `SQLite` pool and counts connection traffic.
pub struct SpySource {
    inner: SqliteSource,
    counters: Arc<Counters>,
}

#[async_trait]
impl ConnectionSource for SpySource {
    async fn acquire(&self) -> Result<Connection, SqlSessionError> {
        match self.inner.acquire().await? {
            Connection::Blocking(inner) => {
                self.counters.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(Connection::Blocking(Box::new(SpyConnection {
                    inner,
                    counters: Arc::clone(&self.counters),
                })))
            }
            other => Ok(other),
        }
    }

    fn mode(&self) -> EngineMode {
        EngineMode::Blocking
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }
}

pub async fn spy_db(
    tag: &str,
    default_session: DefaultSession,
) -> Result<(TempDir, Database, Arc<Counters>), Box<dyn std::error::Error>> {
    let (dir, url) = unique_db_url(tag)?;
    let inner = SqliteSource::connect(&EngineUrl::parse(&url)?, &EngineOptions::default()).await?;
    let counters = Arc::new(Counters::default());
    let engine = Engine::from_source(SpySource {
        inner,
        counters: Arc::clone(&counters),
    });
    let db = Database::from_engine(engine, default_session);
    create_schema(&db).await?;
    Ok((dir, db, counters))
}

/// Drives a rusqlite connection through the async connection interface, so the
/// async call path can be tested without a Postgres server.
struct AsyncAdapter {
    inner: Box<dyn BlockingConnection>,
}

#[async_trait]
impl AsyncConnection for AsyncAdapter {
    async fn query(&mut self, sql: &str, params: &[RowValues]) -> Result<ResultSet, SqlSessionError> {
        tokio::task::yield_now().await;
        self.inner.query(sql, params)
    }

    async fn begin(&mut self) -> Result<(), SqlSessionError> {
        self.inner.begin()
    }

    async fn commit(&mut self) -> Result<(), SqlSessionError> {
        self.inner.commit()
    }

    async fn rollback(&mut self) -> Result<(), SqlSessionError> {
        self.inner.rollback()
    }

    fn database_type(&self) -> DatabaseType {
        self.inner.database_type()
    }
}

pub struct AsyncSqliteSource {
    inner: SqliteSource,
}

#[async_trait]
impl ConnectionSource for AsyncSqliteSource {
    async fn acquire(&self) -> Result<Connection, SqlSessionError> {
        match self.inner.acquire().await? {
            Connection::Blocking(inner) => Ok(Connection::Async(Box::new(AsyncAdapter { inner }))),
            other => Ok(other),
        }
    }

    fn mode(&self) -> EngineMode {
        EngineMode::Async
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }
}

pub async fn async_db(tag: &str) -> Result<(TempDir, Database), Box<dyn std::error::Error>> {
    let (dir, url) = unique_db_url(tag)?;
    let inner = SqliteSource::connect(&EngineUrl::parse(&url)?, &EngineOptions::default()).await?;
    let db = Database::from_engine(
        Engine::from_source(AsyncSqliteSource { inner }),
        DefaultSession::PerCall,
    );
    create_schema(&db).await?;
    Ok((dir, db))
}
