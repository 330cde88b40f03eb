//! Scoped sessions and one async shortcut surface over blocking and async SQL
//! engines.
//!
//! A [`Database`] wraps one engine. Its shortcut methods (`execute`, `get`,
//! `save`, `delete`, `refresh`, `run`, ...) look the same whether the engine's
//! driver blocks (`rusqlite`, offloaded to tokio's blocking pool) or is natively
//! async (`tokio-postgres`). Each call runs on exactly one [`Session`], chosen in
//! this order:
//!
//! 1. the `executor` given in the call's options;
//! 2. the session bound to the current task or thread by [`Database::scope`],
//!    [`Database::bind`], [`Database::enter`] or a [`RequestScope`];
//! 3. the database's [`DefaultSession`].
//!
//! Calls commit and close only sessions they own, so work inside a scope forms one
//! transaction that the scope commits or rolls back as a whole.
//!
//! ```rust,no_run
//! use sql_session::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlSessionError> {
//! let db = Database::create("sqlite:///tmp/app.db", DatabaseOptions::default()).await?;
//! db.scope(|_session| async {
//!     db.execute(
//!         Statement::new("INSERT INTO audit (msg) VALUES (?1)").params(vec!["hello".into()]),
//!         CallOptions::default(),
//!     )
//!     .await?;
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod database;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod error;
pub mod middleware;
pub mod registry;
mod resolver;
pub mod results;
pub mod run;
pub mod session;
pub mod statement;
pub mod translation;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use database::{CallOptions, Database, DatabaseOptions, DefaultSession, SaveOptions};
pub use engine::{
    AsyncConnection, BlockingConnection, Connection, ConnectionSource, Driver, Engine,
    EngineOptions, EngineUrl,
};
pub use entity::{Entity, GetOptions, KeyValues, LockMode};
pub use error::SqlSessionError;
pub use middleware::{RequestOutcome, RequestScope};
pub use registry::{ScopeGuard, SessionBinding};
pub use results::{CustomDbRow, ResultSet};
pub use run::RunContext;
pub use session::{Ownership, Session};
pub use statement::Statement;
pub use translation::{PlaceholderStyle, TranslationMode, translate_placeholders};
pub use types::{DatabaseType, EngineMode, RowValues};
