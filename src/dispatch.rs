//! Runs blocking closures on tokio's blocking pool and awaits them without
//! stalling the caller's scheduler.
//!
//! Pool size, queueing and shutdown are tokio's (`max_blocking_threads`). The
//! caller's task-local session bindings travel with the closure.

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SqlSessionError;
use crate::registry;

/// Run `f` on a worker thread and return its result.
///
/// A panic inside `f` resumes on the awaiting task. If the runtime drops the
/// worker before it finishes, the error is `SqlSessionError::Dispatch`.
///
/// # Errors
/// Whatever `f` returns, or `SqlSessionError::Dispatch`.
pub async fn run_in_pool<F, T, E>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<SqlSessionError> + Send + 'static,
{
    let bindings = registry::snapshot();
    let joined = tokio::task::spawn_blocking(move || registry::within(bindings, f)).await;
    settle(joined)
}

/// Like `run_in_pool`, but hands `f` a token that is cancelled when the awaiting
/// future is dropped.
///
/// Dropping the future cannot stop `f`: a thread blocked inside a driver call
/// finishes that call. `f` decides what to do at its own checkpoints.
///
/// # Errors
/// Whatever `f` returns, or `SqlSessionError::Dispatch`.
pub async fn run_in_pool_cancellable<F, T, E>(f: F) -> Result<T, E>
where
    F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<SqlSessionError> + Send + 'static,
{
    let token = CancellationToken::new();
    let worker_token = token.clone();
    let guard = token.drop_guard();

    let bindings = registry::snapshot();
    let joined =
        tokio::task::spawn_blocking(move || registry::within(bindings, || f(&worker_token))).await;
    guard.disarm();
    settle(joined)
}

fn settle<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<T, E>
where
    E: From<SqlSessionError>,
{
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => {
            debug!(error = %err, "worker task did not complete");
            Err(SqlSessionError::Dispatch(format!("worker task did not complete: {err}")).into())
        }
    }
}
