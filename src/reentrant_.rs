use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use super::{
    cancel_::CancellationToken,
    disposal_::{AsyncDisposable, Disposable, Disposal, DisposeBehavior},
    error_::{DisposeError, LockError},
    flow_::{self, FlowContext, FlowId, LockKey},
    gate_::{Gate, GatePermit, WaitError},
    observer_::{
        ObserverSlot, PropertyObserver,
        PROP_DEPTH, PROP_DISPOSAL_STATE, PROP_IS_HELD,
    },
};

const OBJECT_NAME: &str = "ReentrantAsyncLock";

/// Holder value meaning "unheld".
const K_NO_HOLDER: u64 = 0;

/// A lock that recognizes its holder by flow rather than by thread.
///
/// The flow that holds the lock, and every task or thread it hands its flow
/// context to (see `flow::spawn`), may enter again without waiting on the
/// primary gate. Each level of nesting publishes a fresh gate to the flow for
/// the duration of its critical section, and the reentrant acquisitions made
/// under it serialize on that gate. Unrelated flows queue on the primary gate.
///
/// # Examples
///
/// ```
/// use asyncex_reentrant::{CancellationToken, ReentrantAsyncLock};
///
/// let lock = ReentrantAsyncLock::new();
/// let none = CancellationToken::none();
/// let depth = lock
///     .acquire(&none, || lock.acquire(&none, || lock.depth()))
///     .unwrap()
///     .unwrap();
/// assert_eq!(depth, 2);
/// assert_eq!(lock.depth(), 0);
/// ```
pub struct ReentrantAsyncLock {
    key_: LockKey,
    disposal_: Disposal,
    primary_: Gate,
    holder_: AtomicU64,
    depth_: AtomicUsize,
    observer_: ObserverSlot,
}

impl ReentrantAsyncLock {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_observer(observer: Arc<dyn PropertyObserver>) -> Self {
        Self::builder().observer(observer).build()
    }

    pub fn builder() -> ReentrantAsyncLockBuilder {
        ReentrantAsyncLockBuilder::new()
    }

    /// The number of acquisitions currently active, nested ones included.
    ///
    /// Like every introspection method, the value may be out of date as soon
    /// as it is returned.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth_.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }

    /// The flow holding the primary gate, if any.
    #[inline]
    pub fn holder(&self) -> Option<FlowId> {
        FlowId::from_raw(self.holder_.load(Ordering::Acquire))
    }

    /// Tests if the caller runs inside one of its own acquisitions of this
    /// lock. Never assigns a flow identity.
    pub fn is_held_by_current_flow(&self) -> bool {
        let Option::Some(cx) = flow_::current() else {
            return false;
        };
        let Option::Some(id) = cx.peek_id() else {
            return false;
        };
        self.holder() == Option::Some(id) && cx.nested_gate(self.key_).is_some()
    }

    /// Runs `work` while holding the lock, blocking the calling thread while
    /// waiting.
    ///
    /// The value returned by `work` is handed back as is; if `work` returns a
    /// `Result`, its error reaches the caller untouched. The lock is unwound
    /// before returning, also when `work` panics.
    pub fn acquire<F, R>(&self, cancel: &CancellationToken, work: F) -> Result<R, LockError>
    where
        F: FnOnce() -> R,
    {
        let (flow, id, nested) = self.prepare_()?;
        let entered = match nested {
            Option::Some(gate) => {
                Entered::Nested(self.map_nested_err_(gate.acquire_blocking(cancel), id)?)
            }
            Option::None => {
                let permit = Self::map_primary_err_(self.primary_.acquire_blocking(cancel))?;
                self.on_primary_acquired_(id);
                Entered::Primary(permit)
            }
        };
        let (mut level, inner) = self.enter_level_(&flow, id, entered);
        let output = inner.enter(work);
        level.exit()?;
        Result::Ok(output)
    }

    /// Runs the future produced by `work` while holding the lock, suspending
    /// while waiting.
    ///
    /// Dropping the returned future unwinds the lock as well.
    pub async fn acquire_async<F, Fut>(
        &self,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let (flow, id, nested) = self.prepare_()?;
        let entered = match nested {
            Option::Some(gate) => {
                let r = gate.acquire_async(cancel).await;
                Entered::Nested(self.map_nested_err_(r, id)?)
            }
            Option::None => {
                let r = self.primary_.acquire_async(cancel).await;
                let permit = Self::map_primary_err_(r)?;
                self.on_primary_acquired_(id);
                Entered::Primary(permit)
            }
        };
        let (mut level, inner) = self.enter_level_(&flow, id, entered);
        let output = inner.scope(async move { work().await }).await;
        level.exit()?;
        Result::Ok(output)
    }

    /// Resolves the calling flow and, if it is reentrant, the nested gate it
    /// has to wait on.
    ///
    /// A flow is reentrant when it is the holder *and* it carries a gate
    /// published by one of its own acquisitions of this lock. A flow sharing
    /// the holder's identity without such a gate was handed the flow context
    /// outside of any critical section, and queues on the primary gate like
    /// an unrelated flow.
    fn prepare_(&self) -> Result<(FlowContext, FlowId, Option<Gate>), LockError> {
        self.disposal_.check_not_disposing()?;
        let flow = flow_::current_or_new();
        let id = flow.id();
        let nested = if self.holder_.load(Ordering::Acquire) == id.get() {
            let gate = flow.nested_gate(self.key_).cloned();
            if gate.is_none() {
                log::debug!(
                    "[ReentrantAsyncLock::prepare_] flow {id} shares the \
                    holder identity outside a critical section"
                );
            }
            gate
        } else {
            Option::None
        };
        Result::Ok((flow, id, nested))
    }

    fn on_primary_acquired_(&self, id: FlowId) {
        debug_assert_eq!(self.depth(), 0);
        let prev = self.holder_.swap(id.get(), Ordering::AcqRel);
        debug_assert_eq!(prev, K_NO_HOLDER);
        log::trace!("[ReentrantAsyncLock] {:p} acquired by flow {id}", self);
        self.observer_.notify(PROP_IS_HELD);
    }

    /// Counts the new level and publishes its own gate to the flow.
    fn enter_level_(
        &self,
        flow: &FlowContext,
        id: FlowId,
        entered: Entered,
    ) -> (Level<'_>, FlowContext) {
        let depth = self.depth_.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("[ReentrantAsyncLock::enter_level_] flow {id}, depth {depth}");
        self.observer_.notify(PROP_DEPTH);
        let own_gate = Gate::new();
        let inner = flow.with_nested_gate(self.key_, own_gate.clone());
        let level = Level {
            lock_: self,
            flow_id_: id,
            own_gate_: own_gate,
            entered_: Option::Some(entered),
        };
        (level, inner)
    }

    fn map_primary_err_(r: Result<GatePermit, WaitError>) -> Result<GatePermit, LockError> {
        r.map_err(|e| match e {
            WaitError::Closed => LockError::disposed(OBJECT_NAME),
            WaitError::Cancelled => {
                log::warn!("[ReentrantAsyncLock] primary wait cancelled");
                LockError::Cancelled
            }
        })
    }

    /// A nested gate is closed only when the level that published it has
    /// exited, so waiting on a closed one means the caller escaped that
    /// level's critical section.
    fn map_nested_err_(
        &self,
        r: Result<GatePermit, WaitError>,
        id: FlowId,
    ) -> Result<GatePermit, LockError> {
        r.map_err(|e| match e {
            WaitError::Closed => self.violation_(id),
            WaitError::Cancelled => {
                log::warn!("[ReentrantAsyncLock] nested wait cancelled");
                LockError::Cancelled
            }
        })
    }

    fn violation_(&self, expected: FlowId) -> LockError {
        let e = LockError::SyncViolation {
            expected: Option::Some(expected),
            actual: self.holder(),
            depth: self.depth(),
        };
        log::error!("[ReentrantAsyncLock] {:p}: {e}", self);
        e
    }

    fn teardown_(&self) {
        self.primary_.close();
        self.observer_.notify(PROP_DISPOSAL_STATE);
    }
}

impl Default for ReentrantAsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for ReentrantAsyncLock {
    type Error = DisposeError;

    fn disposal(&self) -> &Disposal {
        &self.disposal_
    }

    /// Closes the primary gate: flows waiting on it, and every later
    /// acquisition, fail with `LockError::Disposed`. A flow already inside
    /// finishes its critical section normally.
    fn dispose(&self) -> Result<(), DisposeError> {
        self.disposal_.dispose(|| self.teardown_()).map(|_| ())
    }
}

impl AsyncDisposable for ReentrantAsyncLock {
    async fn dispose_async(&self) -> Result<(), DisposeError> {
        self.disposal_
            .dispose_async(|| async { self.teardown_() })
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for ReentrantAsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReentrantAsyncLock({:p}, holder: {:?}, depth: {}, {})",
            self,
            self.holder(),
            self.depth(),
            self.disposal_.state(),
        )
    }
}

/// Builds a `ReentrantAsyncLock`.
#[derive(Debug, Default)]
pub struct ReentrantAsyncLockBuilder {
    behavior_: DisposeBehavior,
    observer_: ObserverSlot,
}

impl ReentrantAsyncLockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// What a repeated `dispose` does.
    pub fn behavior(mut self, behavior: DisposeBehavior) -> Self {
        self.behavior_ = behavior;
        self
    }

    /// Receives `depth`, `is_held` and `disposal_state` change notifications.
    pub fn observer(mut self, observer: Arc<dyn PropertyObserver>) -> Self {
        self.observer_ = ObserverSlot::new(Option::Some(observer));
        self
    }

    pub fn build(self) -> ReentrantAsyncLock {
        ReentrantAsyncLock {
            key_: LockKey::next(),
            disposal_: Disposal::new(OBJECT_NAME, self.behavior_),
            primary_: Gate::new(),
            holder_: AtomicU64::new(K_NO_HOLDER),
            depth_: AtomicUsize::new(0),
            observer_: self.observer_,
        }
    }
}

/// Which gate a level went through.
enum Entered {
    Primary(GatePermit),
    Nested(GatePermit),
}

/// One active acquisition. Exiting it, explicitly or on drop, undoes what
/// the acquisition did in reverse.
struct Level<'a> {
    lock_: &'a ReentrantAsyncLock,
    flow_id_: FlowId,
    own_gate_: Gate,
    entered_: Option<Entered>,
}

impl Level<'_> {
    fn exit(&mut self) -> Result<(), LockError> {
        let Option::Some(entered) = self.entered_.take() else {
            return Result::Ok(());
        };
        let lock = self.lock_;
        // Descendants still waiting on this level's gate have escaped it.
        self.own_gate_.close();

        if lock.holder_.load(Ordering::Acquire) != self.flow_id_.get() {
            Self::abandon_(entered);
            return Result::Err(lock.violation_(self.flow_id_));
        }
        let prev = lock.depth_.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        let depth = prev.wrapping_sub(1);
        lock.observer_.notify(PROP_DEPTH);

        match entered {
            Entered::Primary(permit) if depth == 0 => {
                lock.holder_.store(K_NO_HOLDER, Ordering::Release);
                log::trace!(
                    "[ReentrantAsyncLock] {:p} released by flow {}",
                    lock,
                    self.flow_id_,
                );
                drop(permit);
                lock.observer_.notify(PROP_IS_HELD);
                Result::Ok(())
            }
            Entered::Nested(permit) if depth > 0 => {
                log::trace!(
                    "[ReentrantAsyncLock] flow {} left depth {}",
                    self.flow_id_,
                    prev,
                );
                drop(permit);
                Result::Ok(())
            }
            entered => {
                // The outermost level left while nested ones are still inside,
                // or the other way round.
                Self::abandon_(entered);
                Result::Err(lock.violation_(self.flow_id_))
            }
        }
    }

    /// Keeps the gate of a corrupted level shut: the lock is unusable from
    /// here on and contenders must not be let in.
    fn abandon_(entered: Entered) {
        match entered {
            Entered::Primary(p) | Entered::Nested(p) => p.forget(),
        }
    }
}

impl Drop for Level<'_> {
    fn drop(&mut self) {
        if self.entered_.is_none() {
            return;
        }
        log::trace!(
            "[ReentrantAsyncLock::Level::drop] unwinding flow {}",
            self.flow_id_,
        );
        if let Result::Err(e) = self.exit() {
            if !std::thread::panicking() {
                panic!("{e}");
            }
        }
    }
}

impl fmt::Debug for Level<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entered = match &self.entered_ {
            Option::Some(Entered::Primary(_)) => "primary",
            Option::Some(Entered::Nested(_)) => "nested",
            Option::None => "exited",
        };
        write!(
            f,
            "Level(lock: {:p}, flow: {}, {entered})",
            self.lock_,
            self.flow_id_,
        )
    }
}
