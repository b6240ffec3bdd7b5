use std::error::Error as StdError;

use thiserror::Error;

use super::flow_::FlowId;

/// Boxed error carried by fallible cleanup entries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors reported by `AsyncLock` and `ReentrantAsyncLock`.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is disposing or disposed.
    #[error("cannot access a disposed object: {object}")]
    Disposed { object: &'static str },

    /// The wait observed a cancellation request before acquiring.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The holder identity or the nesting depth no longer matches what the
    /// releasing level recorded on entry.
    ///
    /// This is a programming error: a descendant flow escaped its critical
    /// section, or the lock state was corrupted.
    #[error(
        "synchronization lock violation: expected holder {expected:?}, \
        found {actual:?} (depth {depth})"
    )]
    SyncViolation {
        expected: Option<FlowId>,
        actual: Option<FlowId>,
        depth: usize,
    },

    /// `exit` without a matching `enter`.
    #[error("the lock is not held")]
    NotHeld,
}

impl LockError {
    #[inline]
    pub const fn disposed(object: &'static str) -> Self {
        LockError::Disposed { object }
    }

    pub const fn is_disposed(&self) -> bool {
        matches!(self, LockError::Disposed { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, LockError::Cancelled)
    }

    pub const fn is_sync_violation(&self) -> bool {
        matches!(self, LockError::SyncViolation { .. })
    }
}

/// Errors reported by the disposal state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisposeError {
    /// Raised by a second `dispose` when the owner was configured with
    /// `DisposeBehavior::FailIfDisposed`.
    #[error("object {object} is already disposed")]
    AlreadyDisposed { object: &'static str },

    /// The guard found the object disposing or disposed.
    #[error("cannot access a disposed object: {object}")]
    Disposed { object: &'static str },
}

impl From<DisposeError> for LockError {
    fn from(e: DisposeError) -> Self {
        match e {
            DisposeError::AlreadyDisposed { object }
            | DisposeError::Disposed { object } => LockError::Disposed { object },
        }
    }
}

/// Errors reported by `Lifetime` and `AsyncLifetime`.
#[derive(Debug, Error)]
pub enum LifetimeError {
    #[error(transparent)]
    Dispose(#[from] DisposeError),

    /// One or more cleanup entries failed. Every entry still ran.
    #[error("{} cleanup action(s) failed during disposal", .0.len())]
    Aggregate(Vec<BoxError>),
}

impl LifetimeError {
    /// The collected cleanup failures, in the order they were raised.
    pub fn errors(&self) -> &[BoxError] {
        match self {
            LifetimeError::Aggregate(v) => v.as_slice(),
            LifetimeError::Dispose(_) => &[],
        }
    }
}
