use std::{
    error::Error as StdError,
    fmt,
    future::Future,
    sync::atomic::{AtomicU8, Ordering},
};

use futures_lite::future::Boxed;
use parking_lot::Mutex;

use super::error_::DisposeError;

/// The three states of the one-shot teardown.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposalState {
    NotDisposed = 0,
    Disposing   = 1,
    Disposed    = 2,
}

impl DisposalState {
    const fn from_u8_(u: u8) -> Self {
        match u {
            0 => DisposalState::NotDisposed,
            1 => DisposalState::Disposing,
            _ => DisposalState::Disposed,
        }
    }
}

impl fmt::Display for DisposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = match self {
            DisposalState::NotDisposed => "NotDisposed",
            DisposalState::Disposing => "Disposing",
            DisposalState::Disposed => "Disposed",
        };
        write!(f, "DisposalState::{x}")
    }
}

/// What a second `dispose` does.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DisposeBehavior {
    /// Later calls are no-ops.
    #[default]
    Ignore,
    /// Later calls fail with `DisposeError::AlreadyDisposed`.
    FailIfDisposed,
}

enum DisposingHandler {
    Sync(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> Boxed<()> + Send>),
}

/// The disposal state machine shared by every disposable type of this crate.
///
/// `NotDisposed → Disposing → Disposed`. Exactly one caller wins the
/// transition out of `NotDisposed`; it runs the `disposing` handlers and then
/// the owner's teardown.
pub struct Disposal {
    object_: &'static str,
    behavior_: DisposeBehavior,
    state_: AtomicU8,
    handlers_: Mutex<Vec<DisposingHandler>>,
}

impl Disposal {
    pub fn new(object: &'static str, behavior: DisposeBehavior) -> Self {
        Disposal {
            object_: object,
            behavior_: behavior,
            state_: AtomicU8::new(DisposalState::NotDisposed as u8),
            handlers_: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn object(&self) -> &'static str {
        self.object_
    }

    #[inline]
    pub fn behavior(&self) -> DisposeBehavior {
        self.behavior_
    }

    #[inline]
    pub fn state(&self) -> DisposalState {
        DisposalState::from_u8_(self.state_.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        matches!(self.state(), DisposalState::Disposed)
    }

    #[inline]
    pub fn is_disposing(&self) -> bool {
        matches!(self.state(), DisposalState::Disposing)
    }

    /// Fails once the teardown has completed.
    pub fn check_not_disposed(&self) -> Result<(), DisposeError> {
        if self.is_disposed() {
            Result::Err(DisposeError::Disposed { object: self.object_ })
        } else {
            Result::Ok(())
        }
    }

    /// Fails as soon as the teardown has started.
    pub fn check_not_disposing(&self) -> Result<(), DisposeError> {
        if matches!(self.state(), DisposalState::NotDisposed) {
            Result::Ok(())
        } else {
            Result::Err(DisposeError::Disposed { object: self.object_ })
        }
    }

    /// Registers `f` to run when disposal starts, before the teardown.
    pub fn on_disposing<F>(&self, f: F) -> Result<(), DisposeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_handler_(DisposingHandler::Sync(Box::new(f)))
    }

    /// Registers an async handler. A synchronous `dispose` blocks on it.
    pub fn on_disposing_async<F, Fut>(&self, f: F) -> Result<(), DisposeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let h = move || -> Boxed<()> { Box::pin(f()) };
        self.push_handler_(DisposingHandler::Async(Box::new(h)))
    }

    /// Runs the disposal with `teardown` as the owner's hook.
    ///
    /// Returns `Ok(None)` when another caller already won the transition and
    /// the behavior is `DisposeBehavior::Ignore`.
    pub fn dispose<F, R>(&self, teardown: F) -> Result<Option<R>, DisposeError>
    where
        F: FnOnce() -> R,
    {
        if !self.try_begin_()? {
            return Result::Ok(Option::None);
        }
        let _done = DisposedOnDrop(self);
        for h in self.take_handlers_() {
            match h {
                DisposingHandler::Sync(f) => f(),
                DisposingHandler::Async(f) => futures_lite::future::block_on(f()),
            }
        }
        Result::Ok(Option::Some(teardown()))
    }

    /// The asynchronous counterpart of `dispose`.
    pub async fn dispose_async<F, Fut>(
        &self,
        teardown: F,
    ) -> Result<Option<Fut::Output>, DisposeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if !self.try_begin_()? {
            return Result::Ok(Option::None);
        }
        let _done = DisposedOnDrop(self);
        for h in self.take_handlers_() {
            match h {
                DisposingHandler::Sync(f) => f(),
                DisposingHandler::Async(f) => f().await,
            }
        }
        Result::Ok(Option::Some(teardown().await))
    }

    fn try_begin_(&self) -> Result<bool, DisposeError> {
        let r = self.state_.compare_exchange(
            DisposalState::NotDisposed as u8,
            DisposalState::Disposing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match (r, self.behavior_) {
            (Result::Ok(_), _) => {
                log::debug!("[Disposal::try_begin_] {} disposing", self.object_);
                Result::Ok(true)
            }
            (Result::Err(_), DisposeBehavior::Ignore) => Result::Ok(false),
            (Result::Err(_), DisposeBehavior::FailIfDisposed) => {
                Result::Err(DisposeError::AlreadyDisposed { object: self.object_ })
            }
        }
    }

    fn push_handler_(&self, h: DisposingHandler) -> Result<(), DisposeError> {
        let mut g = self.handlers_.lock();
        self.check_not_disposing()?;
        g.push(h);
        Result::Ok(())
    }

    /// Clears the subscriber list so nothing registered stays reachable.
    fn take_handlers_(&self) -> Vec<DisposingHandler> {
        std::mem::take(&mut *self.handlers_.lock())
    }
}

impl fmt::Debug for Disposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Disposal({}, {})", self.object_, self.state())
    }
}

struct DisposedOnDrop<'a>(&'a Disposal);

impl Drop for DisposedOnDrop<'_> {
    fn drop(&mut self) {
        let d = self.0;
        d.state_.store(DisposalState::Disposed as u8, Ordering::Release);
        log::debug!("[Disposal] {} disposed", d.object_);
    }
}

/// A type with a one-shot synchronous teardown.
pub trait Disposable {
    type Error: StdError + Send + Sync + 'static;

    fn disposal(&self) -> &Disposal;

    /// Tears the object down. Repeated calls follow the `DisposeBehavior`
    /// the object was built with.
    fn dispose(&self) -> Result<(), Self::Error>;

    #[inline]
    fn disposal_state(&self) -> DisposalState {
        self.disposal().state()
    }

    #[inline]
    fn is_disposed(&self) -> bool {
        self.disposal().is_disposed()
    }

    #[inline]
    fn is_disposing(&self) -> bool {
        self.disposal().is_disposing()
    }
}

/// A type whose teardown may suspend.
pub trait AsyncDisposable: Disposable {
    fn dispose_async(&self)
        -> impl Future<Output = Result<(), Self::Error>> + Send;
}
