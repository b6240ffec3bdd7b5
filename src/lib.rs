//! A reentrant asynchronous lock that recognizes its holder by flow, along
//! with a non-reentrant async lock and the disposal and lifetime primitives
//! both are built on.

mod async_lock_;
mod cancel_;
mod disposal_;
mod error_;
mod flow_;
mod gate_;
mod lifetime_;
mod observer_;
mod reentrant_;

pub use async_lock_::{AsyncLock, AsyncLockGuard};
pub use cancel_::{CancellationToken, CancellationTokenSource};
pub use disposal_::{
    AsyncDisposable, Disposable, Disposal, DisposalState, DisposeBehavior,
};
pub use error_::{BoxError, DisposeError, LifetimeError, LockError};
pub use flow_::{FlowContext, FlowId};
pub use lifetime_::{AsyncLifetime, Lifetime};
pub use observer_::PropertyObserver;
pub use reentrant_::{ReentrantAsyncLock, ReentrantAsyncLockBuilder};

/// Capturing and propagating the current flow.
pub mod flow {
    pub use super::flow_::{current, current_id, spawn, spawn_blocking, spawn_thread};
}

#[cfg(test)]mod tests_;

pub mod x_deps {
    pub use futures_lite;
    pub use tokio;
    pub use tokio_util;
}
