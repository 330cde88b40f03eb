//! Async engine over `tokio-postgres`, pooled with `bb8`.

mod config;
mod connection;
mod params;
mod query;

pub use config::{PgManager, PgSource};
pub use connection::PgConnection;
pub use params::Params;
pub use query::{build_result_set_from_statement, postgres_extract_value};
