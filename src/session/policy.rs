/// Who is responsible for a resolved session's transaction and lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Passed in explicitly. The call never commits, rolls back or closes it.
    Caller,
    /// Bound by an enclosing scope, which commits or rolls back when it ends.
    Scope,
    /// The shared default session. Calls commit and roll back but never close it.
    Default,
    /// Created for this call alone and closed when it returns.
    Call,
}

/// Commit, rollback and close decisions for one shortcut call.
///
/// Shared by the blocking and async call paths so both follow one rule set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallPolicy {
    pub ownership: Ownership,
    commit: bool,
    read_only: bool,
}

impl CallPolicy {
    pub(crate) fn new(ownership: Ownership, commit: bool, read_only: bool) -> Self {
        Self {
            ownership,
            commit,
            read_only,
        }
    }

    /// A call that autoflushes staged changes writes, whatever its own op is.
    pub(crate) fn with_staged_writes(self, staged: bool) -> Self {
        Self {
            read_only: self.read_only && !staged,
            ..self
        }
    }

    fn owns_transaction(self) -> bool {
        matches!(self.ownership, Ownership::Default | Ownership::Call)
    }

    /// Commit after success: owned, asked to, and the work could have written.
    pub(crate) fn commit_on_success(self) -> bool {
        self.owns_transaction() && self.commit && !self.read_only
    }

    pub(crate) fn rollback_on_error(self) -> bool {
        self.owns_transaction()
    }

    pub(crate) fn close_after(self) -> bool {
        self.ownership == Ownership::Call
    }
}
