//! Context-local session bindings.
//!
//! Two slots are consulted, innermost first:
//!
//! * a tokio task-local, set with `Database::bind`/`scope`, for tasks multiplexed
//!   onto shared worker threads;
//! * a thread-local stack, set with `Database::enter` and restored by an RAII guard,
//!   for code that owns its thread.
//!
//! The thread-local stack is only pushed from outside tokio tasks and only read
//! from outside them, so a guard held across an `.await` in a `block_on` future is
//! never seen by tasks sharing that thread. Any task-local binding present is
//! therefore newer than the thread's guards and wins.
//!
//! Every binding carries the id of the `Database` it belongs to, so several
//! databases can be bound at once without shadowing each other. Spawned tasks start
//! unbound; the dispatch bridge carries the caller's task-local bindings onto the
//! worker thread for the length of one call.

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;

use crate::error::SqlSessionError;
use crate::session::Session;

/// What a scope says calls should use.
#[derive(Clone, Debug)]
pub enum SessionBinding {
    /// This exact session. Calls neither commit nor close it.
    Session(Session),
    /// A fresh session per call, even if an outer scope bound one.
    PerCall,
}

/// The task-local stack of `(database id, binding)` pairs, plus the sessions a
/// `run` closure further up this task currently holds locked.
#[derive(Clone, Debug, Default)]
pub(crate) struct Bindings {
    stack: Vec<(u64, SessionBinding)>,
    held: Vec<u64>,
}

impl Bindings {
    fn lookup(&self, db_id: u64) -> Option<SessionBinding> {
        self.stack
            .iter()
            .rev()
            .find(|(id, _)| *id == db_id)
            .map(|(_, binding)| binding.clone())
    }

    fn pushed(&self, db_id: u64, binding: SessionBinding) -> Self {
        let mut next = self.clone();
        next.stack.push((db_id, binding));
        next
    }

    fn holding(&self, session_id: u64) -> Self {
        let mut next = self.clone();
        next.held.push(session_id);
        next
    }
}

tokio::task_local! {
    static TASK_BINDINGS: Bindings;
}

thread_local! {
    static THREAD_BINDINGS: RefCell<Vec<(u64, SessionBinding)>> = const { RefCell::new(Vec::new()) };
}

fn in_task() -> bool {
    tokio::task::try_id().is_some()
}

/// The binding visible to the current context, if any. Never mutates either slot.
pub(crate) fn lookup(db_id: u64) -> Option<SessionBinding> {
    let task_binding = TASK_BINDINGS
        .try_with(|bindings| bindings.lookup(db_id))
        .ok()
        .flatten();
    if task_binding.is_some() || in_task() {
        return task_binding;
    }
    THREAD_BINDINGS.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|(id, _)| *id == db_id)
            .map(|(_, binding)| binding.clone())
    })
}

/// Run `fut` with `binding` pushed onto the task-local stack.
///
/// The previous stack is back in place once `fut` completes, fails, panics or is
/// dropped, since the new stack only lives inside this future.
pub(crate) async fn scoped<F: Future>(db_id: u64, binding: SessionBinding, fut: F) -> F::Output {
    let next = snapshot().pushed(db_id, binding);
    TASK_BINDINGS.scope(next, fut).await
}

/// Run `fut` with `session_id` marked as locked by this task.
pub(crate) async fn holding<F: Future>(session_id: u64, fut: F) -> F::Output {
    let next = snapshot().holding(session_id);
    TASK_BINDINGS.scope(next, fut).await
}

/// `holding` for synchronous closures on a worker thread.
pub(crate) fn holding_sync<R>(session_id: u64, f: impl FnOnce() -> R) -> R {
    TASK_BINDINGS.sync_scope(snapshot().holding(session_id), f)
}

/// True when a `run` closure up this task's stack holds `session_id` locked, so
/// locking it again would never complete.
pub(crate) fn is_held(session_id: u64) -> bool {
    TASK_BINDINGS
        .try_with(|bindings| bindings.held.contains(&session_id))
        .unwrap_or(false)
}

/// Copy of the caller's task-local bindings, for hand-off to a worker thread.
pub(crate) fn snapshot() -> Bindings {
    TASK_BINDINGS.try_with(Clone::clone).unwrap_or_default()
}

/// Run a synchronous closure with `bindings` installed as the task-local stack.
pub(crate) fn within<R>(bindings: Bindings, f: impl FnOnce() -> R) -> R {
    TASK_BINDINGS.sync_scope(bindings, f)
}

/// Restores the thread-local binding stack when dropped.
///
/// Not `Send`: the binding belongs to the thread that created it.
#[must_use = "the binding is removed as soon as the guard is dropped"]
pub struct ScopeGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

pub(crate) fn enter(db_id: u64, binding: SessionBinding) -> Result<ScopeGuard, SqlSessionError> {
    if in_task() {
        return Err(SqlSessionError::ExecutionError(
            "thread bindings would leak to other tasks on this thread; use Database::bind inside tasks"
                .into(),
        ));
    }
    let depth = THREAD_BINDINGS.with(|stack| {
        let mut stack = stack.borrow_mut();
        let depth = stack.len();
        stack.push((db_id, binding));
        depth
    });
    Ok(ScopeGuard {
        depth,
        _not_send: PhantomData,
    })
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        // Truncating also drops anything an inner guard leaked via mem::forget.
        let _ = THREAD_BINDINGS.try_with(|stack| {
            if let Ok(mut stack) = stack.try_borrow_mut() {
                stack.truncate(self.depth);
            }
        });
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard").field("depth", &self.depth).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_per_call(binding: Option<SessionBinding>) -> bool {
        matches!(binding, Some(SessionBinding::PerCall))
    }

    #[test]
    fn thread_guards_unwind_lifo() {
        assert!(lookup(1).is_none());
        let outer = enter(1, SessionBinding::PerCall).unwrap();
        {
            let _inner = enter(2, SessionBinding::PerCall).unwrap();
            assert!(is_per_call(lookup(1)));
            assert!(is_per_call(lookup(2)));
        }
        assert!(lookup(2).is_none());
        assert!(is_per_call(lookup(1)));
        drop(outer);
        assert!(lookup(1).is_none());
    }

    #[tokio::test]
    async fn task_scope_restores_after_error() {
        let res: Result<(), &str> = scoped(7, SessionBinding::PerCall, async {
            assert!(is_per_call(lookup(7)));
            Err("inner failure")
        })
        .await;
        assert!(res.is_err());
        assert!(lookup(7).is_none());
    }

    #[tokio::test]
    async fn snapshot_reaches_worker_threads() {
        let seen = scoped(9, SessionBinding::PerCall, async {
            let bindings = snapshot();
            tokio::task::spawn_blocking(move || within(bindings, || is_per_call(lookup(9))))
                .await
                .unwrap()
        })
        .await;
        assert!(seen);
    }

    #[tokio::test]
    async fn holding_marks_only_inside_the_future() {
        assert!(!is_held(11));
        let inside = holding(11, async { is_held(11) && !is_held(12) }).await;
        assert!(inside);
        assert!(!is_held(11));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tasks_cannot_take_thread_bindings() {
        let refused = tokio::spawn(async { enter(3, SessionBinding::PerCall).is_err() })
            .await
            .unwrap();
        assert!(refused);
    }
}
