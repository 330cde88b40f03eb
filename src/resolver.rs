//! Picks the one session a call runs on.
//!
//! Precedence: explicit executor, then the innermost context binding, then the
//! database's default. Reading the bindings never changes them.

use tracing::trace;

use crate::database::{DatabaseInner, DefaultSession};
use crate::error::SqlSessionError;
use crate::registry::{self, SessionBinding};
use crate::session::{Ownership, Session};

/// A session plus who answers for its transaction.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub session: Session,
    pub ownership: Ownership,
}

impl Resolved {
    fn new(session: Session, ownership: Ownership) -> Self {
        trace!(session = session.id(), ?ownership, "session resolved");
        Self { session, ownership }
    }
}

pub(crate) fn resolve(db: &DatabaseInner, explicit: Option<&Session>) -> Result<Resolved, SqlSessionError> {
    if let Some(session) = explicit {
        return Ok(Resolved::new(session.clone(), Ownership::Caller));
    }
    match registry::lookup(db.id) {
        Some(SessionBinding::Session(session)) => Ok(Resolved::new(session, Ownership::Scope)),
        Some(SessionBinding::PerCall) => Ok(Resolved::new(Session::new(db.engine.clone()), Ownership::Call)),
        None => fallback(db),
    }
}

fn fallback(db: &DatabaseInner) -> Result<Resolved, SqlSessionError> {
    match db.default_session {
        DefaultSession::PerCall => Ok(Resolved::new(Session::new(db.engine.clone()), Ownership::Call)),
        DefaultSession::Shared => {
            let session = db.shared.get_or_init(|| Session::new(db.engine.clone()));
            Ok(Resolved::new(session.clone(), Ownership::Default))
        }
        DefaultSession::Disabled => Err(SqlSessionError::NoSession(
            "no executor given, no session bound and the default session is disabled".into(),
        )),
    }
}
