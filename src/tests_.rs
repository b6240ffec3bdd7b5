use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use async_channel::{Receiver, Sender};

use super::{
    flow, AsyncDisposable, AsyncLifetime, CancellationToken,
    CancellationTokenSource, Disposable, FlowContext, Lifetime, LockError,
    ReentrantAsyncLock,
};

fn init_env_logger_() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, PartialEq, Eq)]
struct InvalidOperation(&'static str);

/// Ten unrelated threads, each entering a hundred times to do a deliberately
/// non-atomic increment. No update may be lost.
#[test]
fn sync_acquire_loses_no_update() {
    init_env_logger_();

    const THREADS: usize = 10;
    const ROUNDS: usize = 100;

    let lock = ReentrantAsyncLock::new();
    let counter = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let none = CancellationToken::none();
                for _ in 0..ROUNDS {
                    lock.acquire(&none, || {
                        let v = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                    })
                    .unwrap();
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * ROUNDS);
    assert_eq!(lock.depth(), 0);
    assert!(lock.holder().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_acquire_loses_no_update() {
    init_env_logger_();

    const TASKS: usize = 10;
    const ROUNDS: usize = 100;

    let lock = Arc::new(ReentrantAsyncLock::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let lock = lock.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let none = CancellationToken::none();
                for _ in 0..ROUNDS {
                    lock.acquire_async(&none, || async {
                        let v = counter.load(Ordering::Relaxed);
                        tokio::task::yield_now().await;
                        counter.store(v + 1, Ordering::Relaxed);
                    })
                    .await
                    .unwrap();
                }
            })
        })
        .collect();
    for t in tasks {
        assert!(t.await.is_ok());
    }
    assert_eq!(counter.load(Ordering::SeqCst), TASKS * ROUNDS);
    assert_eq!(lock.depth(), 0);
}

/// Re-entering across an await point from one root flow must not deadlock,
/// and the depth returns to where it was.
#[tokio::test]
async fn nested_async_acquire_across_yield_completes() {
    let lock = ReentrantAsyncLock::new();
    let none = CancellationToken::none();
    let before = lock.depth();
    let r = lock
        .acquire_async(&none, || async {
            tokio::task::yield_now().await;
            let outer = lock.depth();
            let inner = lock
                .acquire_async(&none, || async {
                    tokio::task::yield_now().await;
                    lock.depth()
                })
                .await
                .unwrap();
            (outer, inner)
        })
        .await
        .unwrap();
    assert_eq!(r, (1, 2));
    assert_eq!(lock.depth(), before);
    assert!(!lock.is_held());
}

#[tokio::test]
async fn sync_acquire_inside_async_acquire_reenters() {
    let lock = ReentrantAsyncLock::new();
    let none = CancellationToken::none();
    let d = lock
        .acquire_async(&none, || async {
            tokio::task::yield_now().await;
            lock.acquire(&none, || lock.depth()).unwrap()
        })
        .await
        .unwrap();
    assert_eq!(d, 2);
    assert_eq!(lock.depth(), 0);
}

/// ## Scenario
/// 1. The parent flow acquires the lock and spawns eight child tasks that
///    carry its flow context; each child spawns a grandchild of its own.
/// 2. An unrelated task starts waiting for the lock.
/// 3. Children re-enter without deadlocking, but never two at a time, since
///    they all wait on the gate the parent published. Grandchildren wait on
///    the gate of their own parent.
/// 4. The unrelated task only gets in after the parent has left.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_children_reenter_and_serialize() {
    init_env_logger_();

    const CHILDREN: usize = 8;

    let lock = Arc::new(ReentrantAsyncLock::new());
    let none = CancellationToken::none();
    let unrelated_entered = Arc::new(AtomicBool::new(false));

    let (l, flag) = (lock.clone(), unrelated_entered.clone());
    let (started_tx, started_rx) = async_channel::bounded::<()>(1);

    let max_depth = lock
        .acquire_async(&none, || async {
            let unrelated = tokio::spawn(async move {
                started_tx.send(()).await.unwrap();
                l.acquire_async(&CancellationToken::none(), || async {
                    flag.store(true, Ordering::SeqCst);
                })
                .await
            });
            started_rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;

            let inside = Arc::new(AtomicBool::new(false));
            let max_depth = Arc::new(AtomicUsize::new(0));
            let children: Vec<_> = (0..CHILDREN)
                .map(|_| {
                    let (lock, inside, max_depth) =
                        (lock.clone(), inside.clone(), max_depth.clone());
                    flow::spawn(async move {
                        let none = CancellationToken::none();
                        lock.acquire_async(&none, || async {
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            assert_eq!(lock.depth(), 2);
                            tokio::task::yield_now().await;
                            inside.store(false, Ordering::SeqCst);

                            let l = lock.clone();
                            let m = max_depth.clone();
                            let grandchild = flow::spawn(async move {
                                let none = CancellationToken::none();
                                l.acquire_async(&none, || async {
                                    m.fetch_max(l.depth(), Ordering::SeqCst);
                                })
                                .await
                            });
                            grandchild.await.unwrap().unwrap();
                        })
                        .await
                    })
                })
                .collect();
            for c in children {
                c.await.unwrap().unwrap();
            }
            assert!(!unrelated_entered.load(Ordering::SeqCst));
            assert_eq!(lock.depth(), 1);
            (max_depth.load(Ordering::SeqCst), unrelated)
        })
        .await
        .unwrap();

    let (max_depth, unrelated) = max_depth;
    assert_eq!(max_depth, 3);
    unrelated.await.unwrap().unwrap();
    assert!(unrelated_entered.load(Ordering::SeqCst));
    assert_eq!(lock.depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_child_reenters() {
    let lock = Arc::new(ReentrantAsyncLock::new());
    let none = CancellationToken::none();
    let d = lock
        .acquire_async(&none, || async {
            let l = lock.clone();
            flow::spawn_blocking(move || {
                l.acquire(&CancellationToken::none(), || l.depth())
            })
            .await
            .unwrap()
            .unwrap()
        })
        .await
        .unwrap();
    assert_eq!(d, 2);
}

/// The error of `work` reaches the caller as it was produced, and an
/// unrelated flow gets the lock right away afterwards.
#[test]
fn work_error_is_returned_untouched() {
    let lock = ReentrantAsyncLock::new();
    let none = CancellationToken::none();
    let r = lock.acquire(&none, || -> Result<(), InvalidOperation> {
        Result::Err(InvalidOperation("x"))
    });
    let e = r.unwrap().unwrap_err();
    assert_eq!(e, InvalidOperation("x"));
    assert_eq!(e.0, "x");
    assert_eq!(lock.depth(), 0);

    thread::scope(|s| {
        s.spawn(|| {
            assert!(lock.holder().is_none());
            let r = lock.acquire(&none, || lock.depth());
            assert_eq!(r.unwrap(), 1);
        });
    });
}

#[tokio::test]
async fn async_work_error_is_returned_untouched() {
    let lock = ReentrantAsyncLock::new();
    let none = CancellationToken::none();
    let r = lock
        .acquire_async(&none, || async {
            tokio::task::yield_now().await;
            Result::<(), _>::Err(InvalidOperation("x"))
        })
        .await;
    assert_eq!(r.unwrap(), Result::Err(InvalidOperation("x")));
    assert_eq!(lock.depth(), 0);
    assert!(lock.holder().is_none());
}

async fn hold_until_(
    lock: Arc<ReentrantAsyncLock>,
    held: Sender<()>,
    release: Receiver<()>,
) -> Result<(), LockError> {
    lock.acquire_async(&CancellationToken::none(), || async {
        held.send(()).await.unwrap();
        let _ = release.recv().await;
    })
    .await
}

/// ## 测试目标
/// A cancelled wait changes neither the holder nor the depth, and the lock
/// keeps working for the remaining contenders.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_async_wait_is_a_no_op() {
    init_env_logger_();

    let lock = Arc::new(ReentrantAsyncLock::new());
    let (held_tx, held_rx) = async_channel::bounded(1);
    let (release_tx, release_rx) = async_channel::bounded(1);
    let holder = tokio::spawn(hold_until_(lock.clone(), held_tx, release_rx));
    held_rx.recv().await.unwrap();

    let holder_id = lock.holder();
    assert!(holder_id.is_some());
    assert_eq!(lock.depth(), 1);

    let cts = CancellationTokenSource::new();
    let tok = cts.child_token();
    let l = lock.clone();
    let waiter = tokio::spawn(async move { l.acquire_async(&tok, || async {}).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    assert!(cts.try_cancel());
    let r = waiter.await.unwrap();
    assert!(r.unwrap_err().is_cancelled());
    assert_eq!(lock.holder(), holder_id);
    assert_eq!(lock.depth(), 1);

    release_tx.send(()).await.unwrap();
    holder.await.unwrap().unwrap();
    assert_eq!(lock.depth(), 0);
    let none = CancellationToken::none();
    assert!(lock.acquire_async(&none, || async {}).await.is_ok());
}

/// ## 测试目标
/// A child cancelled while waiting on the gate its parent published leaves
/// the holder and the depth alone, and a later child still gets in.
///
/// ## 测试步骤
/// 1. The parent holds the lock and a first child holds the parent's gate.
/// 2. A sibling queues on the same gate and is cancelled.
/// 3. The first child leaves; one more sibling enters at depth 2.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_nested_wait_is_a_no_op() {
    init_env_logger_();

    let lock = Arc::new(ReentrantAsyncLock::new());
    let none = CancellationToken::none();
    let r = lock
        .acquire_async(&none, || async {
            let holder = lock.holder();
            let (held_tx, held_rx) = async_channel::bounded(1);
            let (release_tx, release_rx) = async_channel::bounded(1);
            let first = flow::spawn(hold_until_(lock.clone(), held_tx, release_rx));
            held_rx.recv().await.unwrap();
            assert_eq!(lock.depth(), 2);

            let cts = CancellationTokenSource::new();
            let tok = cts.child_token();
            let l = lock.clone();
            let sibling = flow::spawn(async move { l.acquire_async(&tok, || async {}).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!sibling.is_finished());

            assert!(cts.try_cancel());
            assert!(sibling.await.unwrap().unwrap_err().is_cancelled());
            assert_eq!(lock.holder(), holder);
            assert_eq!(lock.depth(), 2);

            release_tx.send(()).await.unwrap();
            first.await.unwrap().unwrap();
            assert_eq!(lock.depth(), 1);

            let l = lock.clone();
            let later = flow::spawn(async move {
                l.acquire_async(&CancellationToken::none(), || async { l.depth() })
                    .await
            });
            later.await.unwrap().unwrap()
        })
        .await;
    assert_eq!(r.unwrap(), 2);
    assert_eq!(lock.depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_fails_waiters_instead_of_hanging() {
    let lock = Arc::new(ReentrantAsyncLock::new());
    let (held_tx, held_rx) = async_channel::bounded(1);
    let (release_tx, release_rx) = async_channel::bounded(1);
    let holder = tokio::spawn(hold_until_(lock.clone(), held_tx, release_rx));
    held_rx.recv().await.unwrap();

    let l = lock.clone();
    let waiter = tokio::spawn(async move {
        l.acquire_async(&CancellationToken::none(), || async {}).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    lock.dispose_async().await.unwrap();
    assert!(lock.is_disposed());
    let r = waiter.await.unwrap();
    assert!(r.unwrap_err().is_disposed());

    // The holder still finishes and unwinds normally.
    release_tx.send(()).await.unwrap();
    holder.await.unwrap().unwrap();
    assert_eq!(lock.depth(), 0);
}

/// Locks registered with a lifetime are disposed with it, newest first.
#[test]
fn lifetime_disposes_registered_locks() {
    let lifetime = Lifetime::new();
    let first = Arc::new(ReentrantAsyncLock::new());
    let second = Arc::new(ReentrantAsyncLock::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (o, f) = (order.clone(), first.clone());
    lifetime.add(move || o.lock().push(("first", f.is_disposed()))).unwrap();
    lifetime.add_disposable(first.clone()).unwrap();
    let (o, s) = (order.clone(), second.clone());
    lifetime.add(move || o.lock().push(("second", s.is_disposed()))).unwrap();
    lifetime.add_disposable(second.clone()).unwrap();

    lifetime.dispose().unwrap();
    assert_eq!(*order.lock(), [("second", true), ("first", true)]);
    assert!(lifetime.is_terminated());

    let none = CancellationToken::none();
    assert!(first.acquire(&none, || ()).unwrap_err().is_disposed());
}

#[tokio::test]
async fn async_lifetime_disposes_registered_locks() {
    let lifetime = AsyncLifetime::new();
    let lock = Arc::new(ReentrantAsyncLock::new());
    lifetime.add_async_disposable(lock.clone()).unwrap();
    assert_eq!(lifetime.len(), 1);
    lifetime.dispose_async().await.unwrap();
    assert!(lock.is_disposed());
}

/// Two tasks handed the same root flow context outside any critical section
/// share an identity but are not inside each other's acquisition; they still
/// exclude each other.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_roots_sharing_identity_still_exclude() {
    let lock = Arc::new(ReentrantAsyncLock::new());
    let inside = Arc::new(AtomicBool::new(false));
    let root = FlowContext::new();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let (lock, inside) = (lock.clone(), inside.clone());
            tokio::spawn(root.clone().scope(async move {
                for _ in 0..10 {
                    lock.acquire_async(&CancellationToken::none(), || async {
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        assert_eq!(lock.depth(), 1);
                        tokio::task::yield_now().await;
                        inside.store(false, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
                }
            }))
        })
        .collect();
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(lock.depth(), 0);
}
