use std::{fmt, time::Duration};

use parking_lot::Mutex;

use super::{
    cancel_::CancellationToken,
    disposal_::{AsyncDisposable, Disposable, Disposal, DisposeBehavior},
    error_::{DisposeError, LockError},
    gate_::{Gate, GatePermit, WaitError},
};

const OBJECT_NAME: &str = "AsyncLock";

/// A non-reentrant lock that can be entered by blocking the thread or by
/// suspending the task.
///
/// A flow that enters a lock it already holds waits for itself. Use
/// `ReentrantAsyncLock` when the critical section may re-enter.
pub struct AsyncLock {
    disposal_: Disposal,
    gate_: Gate,
    held_: Mutex<Option<GatePermit>>,
}

impl AsyncLock {
    pub fn new() -> Self {
        Self::with_behavior(DisposeBehavior::default())
    }

    pub fn with_behavior(behavior: DisposeBehavior) -> Self {
        AsyncLock {
            disposal_: Disposal::new(OBJECT_NAME, behavior),
            gate_: Gate::new(),
            held_: Mutex::new(Option::None),
        }
    }

    /// Tests if the lock is currently entered.
    ///
    /// The result is out of date the instant it is returned; do not use it
    /// for synchronization.
    pub fn is_held(&self) -> bool {
        self.held_.lock().is_some()
    }

    /// Blocks until the lock is entered.
    pub fn enter(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        self.disposal_.check_not_disposing()?;
        let r = self.gate_.acquire_blocking(cancel);
        self.on_acquired_(map_wait_err_(r)?);
        Result::Ok(())
    }

    /// Suspends until the lock is entered.
    pub async fn enter_async(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        self.disposal_.check_not_disposing()?;
        let r = self.gate_.acquire_async(cancel).await;
        self.on_acquired_(map_wait_err_(r)?);
        Result::Ok(())
    }

    /// Enters only if the lock is free right now.
    pub fn try_enter(&self) -> Result<bool, LockError> {
        self.try_enter_for(Duration::ZERO, &CancellationToken::none())
    }

    /// Blocks at most `timeout`. `Ok(false)` means the timeout elapsed.
    ///
    /// `Duration::MAX` waits without bound.
    pub fn try_enter_for(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        self.disposal_.check_not_disposing()?;
        let r = self.gate_.acquire_timeout_blocking(timeout, cancel);
        Result::Ok(self.on_maybe_acquired_(map_wait_err_(r)?, timeout))
    }

    /// Suspends at most `timeout`. `Ok(false)` means the timeout elapsed.
    ///
    /// Runs on any executor. Inside a tokio runtime its timer is used and
    /// must be enabled.
    pub async fn try_enter_for_async(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        self.disposal_.check_not_disposing()?;
        let r = self.gate_.acquire_timeout_async(timeout, cancel).await;
        Result::Ok(self.on_maybe_acquired_(map_wait_err_(r)?, timeout))
    }

    /// Leaves the lock entered by a previous `enter*` call.
    pub fn exit(&self) -> Result<(), LockError> {
        self.disposal_.check_not_disposed()?;
        let Option::Some(permit) = self.held_.lock().take() else {
            return Result::Err(LockError::NotHeld);
        };
        log::trace!("[AsyncLock::exit] {:p}", self);
        drop(permit);
        Result::Ok(())
    }

    /// Enters and returns a guard that exits when released or dropped.
    pub fn lock(&self, cancel: &CancellationToken) -> Result<AsyncLockGuard<'_>, LockError> {
        self.enter(cancel)?;
        Result::Ok(AsyncLockGuard::new(self))
    }

    pub async fn lock_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AsyncLockGuard<'_>, LockError> {
        self.enter_async(cancel).await?;
        Result::Ok(AsyncLockGuard::new(self))
    }

    fn on_acquired_(&self, permit: GatePermit) {
        log::trace!("[AsyncLock::on_acquired_] {:p}", self);
        let prev = self.held_.lock().replace(permit);
        debug_assert!(prev.is_none());
    }

    fn on_maybe_acquired_(&self, permit: Option<GatePermit>, timeout: Duration) -> bool {
        match permit {
            Option::Some(p) => {
                self.on_acquired_(p);
                true
            }
            Option::None => {
                if !timeout.is_zero() {
                    log::warn!("[AsyncLock::try_enter_for] timed out after {timeout:?}");
                }
                false
            }
        }
    }

    fn teardown_(&self) {
        self.gate_.close();
        let _ = self.held_.lock().take();
    }
}

fn map_wait_err_<T>(r: Result<T, WaitError>) -> Result<T, LockError> {
    r.map_err(|e| match e {
        WaitError::Closed => LockError::disposed(OBJECT_NAME),
        WaitError::Cancelled => {
            log::warn!("[AsyncLock] wait cancelled");
            LockError::Cancelled
        }
    })
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for AsyncLock {
    type Error = DisposeError;

    fn disposal(&self) -> &Disposal {
        &self.disposal_
    }

    /// Closes the lock. Every pending and future wait fails with
    /// `LockError::Disposed`.
    fn dispose(&self) -> Result<(), DisposeError> {
        self.disposal_.dispose(|| self.teardown_()).map(|_| ())
    }
}

impl AsyncDisposable for AsyncLock {
    async fn dispose_async(&self) -> Result<(), DisposeError> {
        self.disposal_
            .dispose_async(|| async { self.teardown_() })
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AsyncLock({:p}, held: {}, {})",
            self,
            self.is_held(),
            self.disposal_.state(),
        )
    }
}

/// Keeps an `AsyncLock` entered until released or dropped.
///
/// Releasing more than once is a no-op.
pub struct AsyncLockGuard<'a> {
    lock_: &'a AsyncLock,
    released_: bool,
}

impl<'a> AsyncLockGuard<'a> {
    fn new(lock: &'a AsyncLock) -> Self {
        AsyncLockGuard { lock_: lock, released_: false }
    }

    pub fn lock(&self) -> &'a AsyncLock {
        self.lock_
    }

    pub fn is_released(&self) -> bool {
        self.released_
    }

    /// Exits the lock if this guard has not done so already.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released_ {
            return Result::Ok(());
        }
        self.released_ = true;
        self.lock_.exit()
    }
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        match self.release() {
            Result::Ok(()) => (),
            Result::Err(e) if e.is_disposed() => {
                log::trace!("[AsyncLockGuard::drop] lock already disposed");
            }
            Result::Err(e) => {
                log::error!("[AsyncLockGuard::drop] {e}");
            }
        }
    }
}

impl fmt::Debug for AsyncLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AsyncLockGuard(lock: {:p}, released: {})",
            self.lock_,
            self.released_,
        )
    }
}
