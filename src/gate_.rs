use std::{
    fmt,
    future::Future,
    pin::pin,
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tokio::{
    runtime::Handle,
    sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError},
};

use super::cancel_::CancellationToken;

/// The permit of a `Gate`; dropping it opens the gate again.
pub(super) type GatePermit = OwnedSemaphorePermit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WaitError {
    /// The gate was closed before or while waiting.
    Closed,
    Cancelled,
}

/// A binary semaphore: at most one permit is out at any time.
///
/// Waiters are queued in FIFO order by `tokio::sync::Semaphore`. Closing the
/// gate fails every current and future waiter with `WaitError::Closed`.
#[derive(Clone)]
pub(super) struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn new() -> Self {
        Gate(Arc::new(Semaphore::new(1)))
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.0.available_permits() == 1
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn close(&self) {
        self.0.close()
    }

    pub fn try_acquire(&self) -> Result<Option<GatePermit>, WaitError> {
        match self.0.clone().try_acquire_owned() {
            Result::Ok(p) => Result::Ok(Option::Some(p)),
            Result::Err(TryAcquireError::NoPermits) => Result::Ok(Option::None),
            Result::Err(TryAcquireError::Closed) => Result::Err(WaitError::Closed),
        }
    }

    /// Waits for the permit. A token cancelled before the call fails without
    /// queueing.
    pub async fn acquire_async(
        &self,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, WaitError> {
        if cancel.is_cancelled() {
            return Result::Err(WaitError::Cancelled);
        }
        let acquire = async {
            self.0
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WaitError::Closed)
        };
        let cancelled = async {
            cancel.cancelled().await;
            Result::Err(WaitError::Cancelled)
        };
        futures_lite::future::or(acquire, cancelled).await
    }

    /// Blocks the calling thread until the permit is acquired.
    pub fn acquire_blocking(
        &self,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, WaitError> {
        futures_lite::future::block_on(self.acquire_async(cancel))
    }

    /// Waits at most `timeout`; `Ok(None)` when it elapses.
    ///
    /// Inside a tokio runtime the timeout is driven by its timer, which must
    /// be enabled. Elsewhere a helper thread stands in for the timer.
    pub async fn acquire_timeout_async(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<GatePermit>, WaitError> {
        if timeout.is_zero() {
            return self.try_acquire_unless_cancelled_(cancel);
        }
        let acquire = async { self.acquire_async(cancel).await.map(Option::Some) };
        let elapsed = async {
            sleep_(timeout).await;
            Result::Ok(Option::None)
        };
        futures_lite::future::or(acquire, elapsed).await
    }

    /// Blocks at most `timeout`; `Ok(None)` when it elapses. A timeout too
    /// large to form a deadline waits without bound.
    pub fn acquire_timeout_blocking(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<GatePermit>, WaitError> {
        if timeout.is_zero() {
            return self.try_acquire_unless_cancelled_(cancel);
        }
        let Option::Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.acquire_blocking(cancel).map(Option::Some);
        };
        match block_on_until_(self.acquire_async(cancel), deadline) {
            Option::Some(r) => r.map(Option::Some),
            Option::None => Result::Ok(Option::None),
        }
    }

    fn try_acquire_unless_cancelled_(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<GatePermit>, WaitError> {
        if cancel.is_cancelled() {
            return Result::Err(WaitError::Cancelled);
        }
        self.try_acquire()
    }

    #[cfg(test)]
    pub fn same_as(&self, other: &Gate) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gate({:p}, free: {}, closed: {})",
            self.0,
            self.is_free(),
            self.is_closed(),
        )
    }
}

/// A flag a waker or a canceller can raise, and a thread can park on.
#[derive(Default)]
struct Signal {
    raised_: Mutex<bool>,
    cond_: Condvar,
}

impl Signal {
    fn raise(&self) {
        *self.raised_.lock() = true;
        self.cond_.notify_all();
    }

    /// Parks until raised or until `deadline`. Returns whether it was raised,
    /// and lowers it again.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut raised = self.raised_.lock();
        while !*raised {
            if self.cond_.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *raised, false)
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.raise()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.raise()
    }
}

/// Polls `fut` on the calling thread, parking between wakeups, and gives up
/// at `deadline`. Dropping `fut` on timeout withdraws it from any queue.
fn block_on_until_<F: Future>(fut: F, deadline: Instant) -> Option<F::Output> {
    let signal = Arc::new(Signal::default());
    let waker = Waker::from(signal.clone());
    let mut cx = Context::from_waker(&waker);
    let mut fut = pin!(fut);
    loop {
        if let Poll::Ready(x) = fut.as_mut().poll(&mut cx) {
            return Option::Some(x);
        }
        if !signal.wait_until(deadline) {
            return Option::None;
        }
    }
}

/// Raises the signal when dropped.
struct RaiseOnDrop(Arc<Signal>);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise()
    }
}

async fn sleep_(timeout: Duration) {
    if Handle::try_current().is_ok() {
        return tokio::time::sleep(timeout).await;
    }
    let Option::Some(deadline) = Instant::now().checked_add(timeout) else {
        return futures_lite::future::pending().await;
    };
    let (tx, rx) = oneshot::channel::<()>();
    let stop = Arc::new(Signal::default());
    let _stop = RaiseOnDrop(stop.clone());
    // The helper leaves as soon as the sleep is dropped.
    thread::spawn(move || {
        if !stop.wait_until(deadline) {
            let _ = tx.send(());
        }
    });
    let _ = rx.await;
}
