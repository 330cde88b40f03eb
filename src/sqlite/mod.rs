//! Blocking engine over `rusqlite`, pooled with `bb8`.

mod config;
mod connection;
mod params;
mod query;

pub use config::{SqliteManager, SqliteSource};
pub use connection::SqliteConnection;
pub use params::Params;
pub use query::{build_result_set, execute_blocking, sqlite_extract_value};
