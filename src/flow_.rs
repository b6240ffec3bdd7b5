//! Flow identity and flow-local storage.
//!
//! A *flow* is a logical chain of execution: a call, every continuation it
//! awaits, and the child tasks it deliberately hands its context to. Threads
//! are not flows; an async task may resume on any worker thread after each
//! await point, so the flow context lives in a tokio task-local and is carried
//! to children explicitly by the `spawn*` helpers of this module.

use std::{
    fmt,
    future::Future,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    thread,
};

use tokio::task::JoinHandle;

use super::gate_::Gate;

tokio::task_local! {
    static CURRENT_FLOW: FlowContext;
}

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(0);

/// The identity of a flow. Never zero; zero stands for "no flow".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(NonZeroU64);

impl FlowId {
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub(super) const fn from_raw(raw: u64) -> Option<FlowId> {
        match NonZeroU64::new(raw) {
            Option::Some(n) => Option::Some(FlowId(n)),
            Option::None => Option::None,
        }
    }

    fn next_() -> FlowId {
        Self::next_from_(&NEXT_FLOW_ID)
    }

    /// The counter wraps; the zero produced on wraparound is skipped.
    fn next_from_(counter: &AtomicU64) -> FlowId {
        loop {
            let raw = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Option::Some(id) = FlowId::from_raw(raw) {
                return id;
            }
        }
    }
}

impl fmt::Debug for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowId({})", self.0)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key distinguishing the nested gates of different locks in one flow.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) struct LockKey(u64);

impl LockKey {
    pub(super) fn next() -> LockKey {
        static NEXT_LOCK_KEY: AtomicU64 = AtomicU64::new(1);
        LockKey(NEXT_LOCK_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// One published nested gate. The chain through `prev_` is the stack of
/// gates of the enclosing acquisitions, innermost first.
struct NestedRoot {
    lock_: LockKey,
    gate_: Gate,
    prev_: Option<Arc<NestedRoot>>,
}

/// The flow-local state carried by a flow: its lazily assigned identity and
/// the nested gates published by the acquisitions it is currently inside.
///
/// A `FlowContext` is an immutable snapshot. Publishing a nested gate produces
/// a new context that is installed only for the duration of a scope, so
/// leaving the scope restores the previous one. All snapshots of one flow
/// share its identity.
#[derive(Clone)]
pub struct FlowContext {
    ident_: Arc<OnceLock<FlowId>>,
    nested_: Option<Arc<NestedRoot>>,
}

impl FlowContext {
    /// Creates the context of a new root flow. Its identity is assigned on
    /// first use.
    pub fn new() -> Self {
        FlowContext {
            ident_: Arc::new(OnceLock::new()),
            nested_: Option::None,
        }
    }

    /// The identity of this flow, assigning one if none was assigned yet.
    pub fn id(&self) -> FlowId {
        *self.ident_.get_or_init(FlowId::next_)
    }

    /// The identity of this flow if it has been assigned, without assigning.
    pub fn peek_id(&self) -> Option<FlowId> {
        self.ident_.get().copied()
    }

    /// Runs `fut` with this context installed as the current flow.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_FLOW.scope(self, fut).await
    }

    /// Runs `f` with this context installed as the current flow.
    pub fn enter<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        CURRENT_FLOW.sync_scope(self, f)
    }

    pub(super) fn nested_gate(&self, lock: LockKey) -> Option<&Gate> {
        let mut curr = self.nested_.as_deref();
        while let Option::Some(root) = curr {
            if root.lock_ == lock {
                return Option::Some(&root.gate_);
            }
            curr = root.prev_.as_deref();
        }
        Option::None
    }

    pub(super) fn with_nested_gate(&self, lock: LockKey, gate: Gate) -> Self {
        FlowContext {
            ident_: self.ident_.clone(),
            nested_: Option::Some(Arc::new(NestedRoot {
                lock_: lock,
                gate_: gate,
                prev_: self.nested_.clone(),
            })),
        }
    }

    #[cfg(test)]
    pub(super) fn nested_len(&self) -> usize {
        let mut n = 0usize;
        let mut curr = self.nested_.as_deref();
        while let Option::Some(root) = curr {
            n += 1;
            curr = root.prev_.as_deref();
        }
        n
    }
}

impl Default for FlowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowContext")
            .field("id", &self.peek_id())
            .field("nested", &self.nested_.is_some())
            .finish()
    }
}

/// The context of the current flow, if the caller runs inside one.
pub fn current() -> Option<FlowContext> {
    CURRENT_FLOW.try_with(FlowContext::clone).ok()
}

/// The identity of the current flow, if one is installed and identified.
pub fn current_id() -> Option<FlowId> {
    CURRENT_FLOW.try_with(FlowContext::peek_id).ok().flatten()
}

/// The context of the current flow, or a new root flow.
pub(super) fn current_or_new() -> FlowContext {
    current().unwrap_or_default()
}

/// Spawns `fut` on the tokio runtime as a descendant of the current flow.
///
/// Outside of any flow this is the same as `tokio::spawn`.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Option::Some(cx) => tokio::spawn(cx.scope(fut)),
        Option::None => tokio::spawn(fut),
    }
}

/// Runs `f` on tokio's blocking pool as a descendant of the current flow.
pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let cx = current();
    tokio::task::spawn_blocking(move || match cx {
        Option::Some(cx) => cx.enter(f),
        Option::None => f(),
    })
}

/// Runs `f` on a new OS thread as a descendant of the current flow.
pub fn spawn_thread<F, R>(f: F) -> thread::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let cx = current();
    thread::spawn(move || match cx {
        Option::Some(cx) => cx.enter(f),
        Option::None => f(),
    })
}
