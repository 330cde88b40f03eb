//! Everything an application usually needs, in one import.

pub use crate::database::{CallOptions, Database, DatabaseOptions, DefaultSession, SaveOptions};
pub use crate::engine::{Engine, EngineOptions, EngineUrl};
pub use crate::entity::{Entity, GetOptions, KeyValues, LockMode};
pub use crate::error::SqlSessionError;
pub use crate::middleware::{RequestOutcome, RequestScope};
pub use crate::registry::{ScopeGuard, SessionBinding};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::run::RunContext;
pub use crate::session::{Ownership, Session};
pub use crate::statement::Statement;
pub use crate::translation::TranslationMode;
pub use crate::types::{DatabaseType, EngineMode, RowValues};
