//! Per-request session scoping for a hosting service framework.
//!
//! The framework's own middleware hook calls `RequestScope::dispatch` once per
//! inbound request with the request and the continuation that produces the
//! response. Handlers reach the request's session through ordinary shortcut calls
//! or `Database::session`, so no framework-specific injection is needed.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::database::{Database, close_quietly};
use crate::error::SqlSessionError;

/// Tells a request scope whether the response counts as a success.
pub trait RequestOutcome {
    fn should_commit(&self) -> bool;
}

impl<T, E> RequestOutcome for Result<T, E> {
    fn should_commit(&self) -> bool {
        self.is_ok()
    }
}

/// Binds a fresh session around each request.
///
/// ```rust,no_run
/// use sql_session::prelude::*;
///
/// # async fn demo(db: Database) -> Result<(), SqlSessionError> {
/// let scope = RequestScope::new(&db);
/// let response = scope
///     .dispatch("GET /users/1", |_req| async {
///         db.get_with::<User>(1_i64, GetOptions::default()).await
///     })
///     .await?;
/// # let _ = response;
/// # Ok(())
/// # }
/// # #[derive(Debug)] struct User;
/// # impl Entity for User {
/// #     const TABLE: &'static str = "users";
/// #     const PRIMARY_KEY: &'static [&'static str] = &["id"];
/// #     const COLUMNS: &'static [&'static str] = &[];
/// #     fn primary_key(&self) -> Vec<RowValues> { vec![] }
/// #     fn values(&self) -> Vec<RowValues> { vec![] }
/// #     fn from_row(_: &CustomDbRow) -> Result<Self, SqlSessionError> { Ok(User) }
/// #     fn assign_key(&mut self, _: &[RowValues]) {}
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RequestScope {
    db: Database,
    commit_on_success: bool,
}

impl RequestScope {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            commit_on_success: true,
        }
    }

    /// When off, every request's session is rolled back; handlers commit explicitly.
    #[must_use]
    pub fn commit_on_success(mut self, commit: bool) -> Self {
        self.commit_on_success = commit;
        self
    }

    /// Call `next` exactly once with a fresh session bound.
    ///
    /// The session is committed if the response reports success, rolled back
    /// otherwise, and closed in every case, including a panic in `next`, which is
    /// resumed afterwards. Inside an enclosing scope for the same database (a
    /// mounted sub-application) the request runs on that scope untouched.
    ///
    /// # Errors
    /// Returns the store error if the final commit fails; the response is dropped.
    pub async fn dispatch<Req, Res, N, Fut>(&self, request: Req, next: N) -> Result<Res, SqlSessionError>
    where
        N: FnOnce(Req) -> Fut,
        Fut: Future<Output = Res>,
        Res: RequestOutcome,
    {
        if self.db.is_scoped() {
            return Ok(next(request).await);
        }

        let session = self.db.new_session();
        debug!(session = session.id(), "request scope opened");
        let outcome = AssertUnwindSafe(self.db.bind(&session, next(request)))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(panic) => {
                close_quietly(&session).await;
                std::panic::resume_unwind(panic);
            }
        };

        let committed = if self.commit_on_success && response.should_commit() {
            session.commit().await
        } else {
            Ok(())
        };
        if let Err(e) = &committed {
            warn!(session = session.id(), error = %e, "request commit failed");
        }
        // Closing rolls back whatever the request left uncommitted.
        close_quietly(&session).await;
        debug!(session = session.id(), "request scope closed");
        committed.map(|()| response)
    }
}
