//! LIFO lifetime managers.
//!
//! A lifetime collects cleanup entries while the owner is alive and runs them
//! exactly once, newest first, when it is disposed. Failures of individual
//! entries are collected rather than cutting the teardown short.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures_lite::future::{Boxed, FutureExt};
use parking_lot::Mutex;

use super::{
    disposal_::{AsyncDisposable, Disposable, Disposal, DisposeBehavior},
    error_::{BoxError, DisposeError, LifetimeError},
};

type SyncCleanup = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;
type AsyncCleanup = Box<dyn FnOnce() -> Boxed<Result<(), BoxError>> + Send>;

enum Cleanup {
    Sync(SyncCleanup),
    Async(AsyncCleanup),
}

/// The entry list shared by both lifetime flavors.
struct Registry<C> {
    entries_: Mutex<Vec<C>>,
    terminated_: Arc<AtomicBool>,
}

impl<C> Registry<C> {
    fn new(seed: impl FnOnce(Arc<AtomicBool>) -> C) -> Self {
        let terminated = Arc::new(AtomicBool::new(false));
        Registry {
            // First in, so it runs last.
            entries_: Mutex::new(vec![seed(terminated.clone())]),
            terminated_: terminated,
        }
    }

    /// Appends unless the owner has started disposing. The disposal state is
    /// checked under the entry lock, so an entry either makes it into the
    /// snapshot taken by the teardown or is rejected.
    fn push_(&self, disposal: &Disposal, c: C) -> Result<(), (C, DisposeError)> {
        let mut g = self.entries_.lock();
        if let Result::Err(e) = disposal.check_not_disposing() {
            return Result::Err((c, e));
        }
        g.push(c);
        Result::Ok(())
    }

    fn take_(&self) -> Vec<C> {
        std::mem::take(&mut *self.entries_.lock())
    }

    /// The number of user entries, excluding the seeded terminal one.
    fn len_(&self) -> usize {
        self.entries_.lock().len().saturating_sub(1)
    }

    fn is_terminated_(&self) -> bool {
        self.terminated_.load(Ordering::Acquire)
    }
}

fn mark_terminated_(flag: &AtomicBool) {
    flag.store(true, Ordering::Release);
}

/// Outcome of running every entry. A panicking entry does not stop the
/// others; the first panic is raised again once all of them have run.
#[derive(Default)]
struct Teardown {
    errors_: Vec<BoxError>,
    panic_: Option<Box<dyn Any + Send>>,
}

impl Teardown {
    fn record_(&mut self, r: std::thread::Result<Result<(), BoxError>>) {
        match r {
            Result::Ok(Result::Ok(())) => (),
            Result::Ok(Result::Err(e)) => self.errors_.push(e),
            Result::Err(payload) => {
                log::error!("[Lifetime] cleanup action panicked");
                self.panic_.get_or_insert(payload);
            }
        }
    }

    fn finish_(self) -> Result<(), LifetimeError> {
        if let Option::Some(payload) = self.panic_ {
            panic::resume_unwind(payload);
        }
        if self.errors_.is_empty() {
            Result::Ok(())
        } else {
            log::warn!("[Lifetime] {} cleanup action(s) failed", self.errors_.len());
            Result::Err(LifetimeError::Aggregate(self.errors_))
        }
    }
}

/// A registry of synchronous cleanup actions run in reverse order on
/// `dispose`.
pub struct Lifetime {
    disposal_: Disposal,
    registry_: Registry<SyncCleanup>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::with_behavior(DisposeBehavior::default())
    }

    pub fn with_behavior(behavior: DisposeBehavior) -> Self {
        Lifetime {
            disposal_: Disposal::new("Lifetime", behavior),
            registry_: Registry::new(|flag| -> SyncCleanup {
                Box::new(move || {
                    mark_terminated_(&flag);
                    Result::Ok(())
                })
            }),
        }
    }

    /// `true` once every cleanup entry has run.
    pub fn is_terminated(&self) -> bool {
        self.registry_.is_terminated_()
    }

    pub fn len(&self) -> usize {
        self.registry_.len_()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `f` to run on `dispose`. If it panics the remaining
    /// entries still run, then the panic resumes out of `dispose`.
    pub fn add<F>(&self, f: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_fallible(move || {
            f();
            Result::<(), BoxError>::Ok(())
        })
    }

    pub fn add_fallible<F, E>(&self, f: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        let c: SyncCleanup = Box::new(move || f().map_err(Into::into));
        self.push_(c)
    }

    /// Disposes `d` when this lifetime is disposed.
    pub fn add_disposable<D>(&self, d: Arc<D>) -> Result<(), LifetimeError>
    where
        D: Disposable + Send + Sync + 'static,
    {
        self.add_fallible(move || d.dispose())
    }

    /// Runs `subscribe` now and defers `unsubscribe` to the teardown.
    ///
    /// If disposal starts while subscribing, `unsubscribe` runs before this
    /// returns the error.
    pub fn subscribe<S, U>(&self, subscribe: S, unsubscribe: U) -> Result<(), LifetimeError>
    where
        S: FnOnce(),
        U: FnOnce() + Send + 'static,
    {
        self.disposal_.check_not_disposing()?;
        subscribe();
        let c: SyncCleanup = Box::new(move || {
            unsubscribe();
            Result::Ok(())
        });
        self.registry_
            .push_(&self.disposal_, c)
            .or_else(|(c, e)| {
                let _ = c();
                Result::Err(LifetimeError::from(e))
            })
    }

    fn push_(&self, c: SyncCleanup) -> Result<(), LifetimeError> {
        self.registry_
            .push_(&self.disposal_, c)
            .map_err(|(_, e)| LifetimeError::from(e))
    }

    fn run_entries_(&self) -> Result<(), LifetimeError> {
        let entries = self.registry_.take_();
        log::trace!("[Lifetime::run_entries_] {} entries", entries.len());
        let mut teardown = Teardown::default();
        for c in entries.into_iter().rev() {
            teardown.record_(panic::catch_unwind(AssertUnwindSafe(c)));
        }
        teardown.finish_()
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for Lifetime {
    type Error = LifetimeError;

    fn disposal(&self) -> &Disposal {
        &self.disposal_
    }

    fn dispose(&self) -> Result<(), LifetimeError> {
        match self.disposal_.dispose(|| self.run_entries_())? {
            Option::Some(r) => r,
            Option::None => Result::Ok(()),
        }
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("state", &self.disposal_.state())
            .field("len", &self.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// A registry of synchronous and asynchronous cleanup actions run in reverse
/// order, awaiting each asynchronous one before moving to the next.
pub struct AsyncLifetime {
    disposal_: Disposal,
    registry_: Registry<Cleanup>,
}

impl AsyncLifetime {
    pub fn new() -> Self {
        Self::with_behavior(DisposeBehavior::default())
    }

    pub fn with_behavior(behavior: DisposeBehavior) -> Self {
        AsyncLifetime {
            disposal_: Disposal::new("AsyncLifetime", behavior),
            registry_: Registry::new(|flag| {
                Cleanup::Sync(Box::new(move || {
                    mark_terminated_(&flag);
                    Result::Ok(())
                }))
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.registry_.is_terminated_()
    }

    pub fn len(&self) -> usize {
        self.registry_.len_()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add<F>(&self, f: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_(Cleanup::Sync(Box::new(move || {
            f();
            Result::Ok(())
        })))
    }

    pub fn add_fallible<F, E>(&self, f: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.push_(Cleanup::Sync(Box::new(move || f().map_err(Into::into))))
    }

    pub fn add_async<F, Fut, E>(&self, f: F) -> Result<(), LifetimeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let c: AsyncCleanup = Box::new(move || {
            Box::pin(async move { f().await.map_err(Into::into) })
        });
        self.push_(Cleanup::Async(c))
    }

    pub fn add_disposable<D>(&self, d: Arc<D>) -> Result<(), LifetimeError>
    where
        D: Disposable + Send + Sync + 'static,
    {
        self.add_fallible(move || d.dispose())
    }

    pub fn add_async_disposable<D>(&self, d: Arc<D>) -> Result<(), LifetimeError>
    where
        D: AsyncDisposable + Send + Sync + 'static,
    {
        self.add_async(move || async move { d.dispose_async().await })
    }

    pub fn subscribe<S, U>(&self, subscribe: S, unsubscribe: U) -> Result<(), LifetimeError>
    where
        S: FnOnce(),
        U: FnOnce() + Send + 'static,
    {
        self.disposal_.check_not_disposing()?;
        subscribe();
        let c = Cleanup::Sync(Box::new(move || {
            unsubscribe();
            Result::Ok(())
        }));
        self.registry_
            .push_(&self.disposal_, c)
            .or_else(|(c, e)| {
                if let Cleanup::Sync(f) = c {
                    let _ = f();
                }
                Result::Err(LifetimeError::from(e))
            })
    }

    fn push_(&self, c: Cleanup) -> Result<(), LifetimeError> {
        self.registry_
            .push_(&self.disposal_, c)
            .map_err(|(_, e)| LifetimeError::from(e))
    }

    async fn run_entries_async_(&self) -> Result<(), LifetimeError> {
        let entries = self.registry_.take_();
        log::trace!("[AsyncLifetime::run_entries_async_] {} entries", entries.len());
        let mut teardown = Teardown::default();
        for c in entries.into_iter().rev() {
            let r = match c {
                Cleanup::Sync(f) => panic::catch_unwind(AssertUnwindSafe(f)),
                Cleanup::Async(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Result::Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Result::Err(payload) => Result::Err(payload),
                },
            };
            teardown.record_(r);
        }
        teardown.finish_()
    }
}

impl Default for AsyncLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for AsyncLifetime {
    type Error = LifetimeError;

    fn disposal(&self) -> &Disposal {
        &self.disposal_
    }

    /// Blocks the calling thread on the asynchronous entries.
    fn dispose(&self) -> Result<(), LifetimeError> {
        futures_lite::future::block_on(self.dispose_async())
    }
}

impl AsyncDisposable for AsyncLifetime {
    async fn dispose_async(&self) -> Result<(), LifetimeError> {
        let r = self
            .disposal_
            .dispose_async(|| self.run_entries_async_())
            .await?;
        r.unwrap_or(Result::Ok(()))
    }
}

impl fmt::Debug for AsyncLifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLifetime")
            .field("state", &self.disposal_.state())
            .field("len", &self.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
