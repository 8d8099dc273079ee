// Copyright (c) Microsoft Corporation.

//! Identity of the routine that is calling into a [`Store`][crate::Store].
//!
//! A routine is a logical unit of work. Many routines may be multiplexed onto a single OS thread
//! by a cooperative executor and a routine may move between OS threads between polls, so neither
//! the thread ID nor a `thread_local!` is enough to tell routines apart. Instead, each routine is
//! given a [`RoutineId`] from a process-wide counter and the executor-facing code marks the
//! routine as *entered* on the current thread whenever it runs.
//!
//! [`current()`] resolves the identity of the caller:
//!
//! 1. If a routine is entered on the current thread, its identity is returned.
//! 2. Otherwise, the current thread is itself treated as a routine and a per-thread identity is
//!    returned, lazily assigned on first use.
//!
//! The easiest way to give each task its own identity is to wrap its future via [`scope()`]:
//!
//! ```
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//! use routine_local::routine;
//!
//! let mut pool = LocalPool::new();
//! let spawner = pool.spawner();
//!
//! let first = routine::scope(async { routine::current() });
//! let second = routine::scope(async { routine::current() });
//!
//! let first = spawner.spawn_local_with_handle(first).unwrap();
//! let second = spawner.spawn_local_with_handle(second).unwrap();
//!
//! // Both tasks run on the same thread but each has its own identity.
//! let (first, second) = pool.run_until(async { (first.await, second.await) });
//! assert_ne!(first, second);
//! ```

use std::cell::{Cell, OnceCell};
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task;

use negative_impl::negative_impl;
use pin_project::pin_project;
use xxhash_rust::xxh3::xxh3_64;

/// Returns the identity of the calling routine.
///
/// Never blocks and never touches the lock of any store.
pub fn current() -> RoutineId {
    ENTERED_ROUTINE
        .get()
        .unwrap_or_else(|| THREAD_ROUTINE.with(|id| *id.get_or_init(RoutineId::new)))
}

/// Returns `true` if a [`Routine`] is entered on the current thread, `false` if [`current()`]
/// would fall back to the identity of the thread itself.
pub fn is_entered() -> bool {
    ENTERED_ROUTINE.get().is_some()
}

/// Wraps a future so that it runs as a new routine with its own identity.
///
/// Shorthand for `Routine::new().wrap(future)`.
pub fn scope<F>(future: F) -> WithRoutine<F>
where
    F: Future,
{
    Routine::new().wrap(future)
}

thread_local! {
    // The routine currently being executed on this thread, if any.
    static ENTERED_ROUTINE: Cell<Option<RoutineId>> = const { Cell::new(None) };

    // Identity of the thread when it is not executing any entered routine.
    static THREAD_ROUTINE: OnceCell<RoutineId> = const { OnceCell::new() };
}

// Shared by all threads. Values are never reused, so a stale identity can never alias a live one.
static NEXT_ROUTINE_ID_VALUE: AtomicU64 = AtomicU64::new(0);

/// Uniquely identifies a routine among all routines in the process.
///
/// Identities are never reused, so two routines never observe the same identity, whether or not
/// they are alive at the same time.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct RoutineId {
    // Just for uniqueness. A global counter, incremented for each new routine.
    value: u64,

    // Precomputed hash. The identity is immutable, so it never has to be recomputed.
    hash: u64,
}

impl RoutineId {
    fn new() -> Self {
        let value = NEXT_ROUTINE_ID_VALUE.fetch_add(1, Ordering::Relaxed);
        let hash = xxh3_64(&value.to_ne_bytes());

        Self { value, hash }
    }

    /// The numeric value of the identity, for diagnostic purposes.
    pub fn value(&self) -> u64 {
        self.value
    }

    pub(crate) fn precomputed_hash(&self) -> u64 {
        self.hash
    }
}

impl Hash for RoutineId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Slot tables use a pass-through hasher, so this value is the final hash value.
        state.write_u64(self.hash);
    }
}

impl PartialOrd for RoutineId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RoutineId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl Debug for RoutineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutineId")
            .field("value", &self.value)
            .finish()
    }
}

impl Display for RoutineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "routine#{}", self.value)
    }
}

/// A logical unit of work with its own identity, independent of the thread that executes it.
///
/// Whoever drives the routine (typically an executor, via [`WithRoutine`]) enters it on the
/// current thread for as long as the routine's code runs. While entered, [`current()`] returns
/// the routine's identity.
///
/// A routine can only be executing in one place at a time. It is not `Clone` and not `Sync`, so
/// it cannot be run from two threads at once:
///
/// ```compile_fail
/// use std::thread;
/// use routine_local::routine::{self, Routine};
///
/// let shared = Routine::new();
///
/// thread::scope(|s| {
///     s.spawn(|| shared.run(routine::current));
///     s.spawn(|| shared.run(routine::current));
/// });
/// ```
///
/// It can still move between threads, carrying its identity along.
#[derive(Debug)]
pub struct Routine {
    id: RoutineId,
}

// Two threads running the same routine at once would share all its slots.
#[negative_impl]
impl !Sync for Routine {}

impl Routine {
    /// Creates a routine with a fresh identity.
    pub fn new() -> Self {
        Self {
            id: RoutineId::new(),
        }
    }

    pub fn id(&self) -> RoutineId {
        self.id
    }

    // Marks this routine as the one executing on the current thread until the returned guard is
    // dropped, at which point the previously entered routine (if any) is restored. Guards must be
    // dropped in the reverse order of their creation, so a guard must never be held across an
    // await point. The public API only exposes closure and poll scoped entry for this reason.
    pub(crate) fn enter(&self) -> EnterGuard {
        let previous = ENTERED_ROUTINE.replace(Some(self.id));

        EnterGuard {
            entered: self.id,
            previous,
        }
    }

    /// Executes a closure as this routine.
    ///
    /// To run asynchronous code as a routine, use [`wrap()`][Self::wrap] instead.
    pub fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _entered = self.enter();
        f()
    }

    /// Wraps a future so that the routine is entered during every poll of the future.
    pub fn wrap<F>(self, future: F) -> WithRoutine<F>
    where
        F: Future,
    {
        WithRoutine {
            future,
            routine: self,
        }
    }
}

impl Default for Routine {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a [`Routine`] entered on the current thread. Restores the previous state when dropped.
#[derive(Debug)]
#[must_use = "the routine is only entered while the guard is alive"]
pub(crate) struct EnterGuard {
    entered: RoutineId,
    previous: Option<RoutineId>,
}

// Restores state of the thread it was created on, so it must stay there.
#[negative_impl]
impl !Send for EnterGuard {}
#[negative_impl]
impl !Sync for EnterGuard {}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let current = ENTERED_ROUTINE.replace(self.previous);

        debug_assert_eq!(
            current,
            Some(self.entered),
            "routine enter guards were dropped out of order"
        );
    }
}

/// A future that runs as a specific [`Routine`], entering it for the duration of each poll.
///
/// Created by [`scope()`] or [`Routine::wrap()`].
#[pin_project]
#[derive(Debug)]
pub struct WithRoutine<F> {
    #[pin]
    future: F,

    routine: Routine,
}

impl<F> WithRoutine<F> {
    pub fn routine_id(&self) -> RoutineId {
        self.routine.id()
    }
}

impl<F> Future for WithRoutine<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = self.project();

        let _entered = this.routine.enter();
        this.future.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    use futures::executor::{block_on, LocalPool};
    use futures::future::poll_fn;
    use futures::task::LocalSpawnExt;
    use mockall::mock;

    use super::*;

    async fn yield_now() {
        let mut yielded = false;

        poll_fn(|cx| {
            if yielded {
                task::Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                task::Poll::Pending
            }
        })
        .await
    }

    #[test]
    fn thread_identity_is_stable() {
        assert!(!is_entered());
        assert_eq!(current(), current());
    }

    #[test]
    fn threads_have_distinct_identities() {
        let here = current();
        let there = thread::spawn(current).join().unwrap();

        assert_ne!(here, there);
    }

    #[test]
    fn routines_have_distinct_identities() {
        let a = Routine::new();
        let b = Routine::new();

        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn enter_overrides_and_restores() {
        let thread_id = current();
        let routine = Routine::new();

        {
            let _entered = routine.enter();
            assert!(is_entered());
            assert_eq!(routine.id(), current());
        }

        assert!(!is_entered());
        assert_eq!(thread_id, current());
    }

    #[test]
    fn nested_routines() {
        let outer = Routine::new();
        let inner = Routine::new();

        outer.run(|| {
            assert_eq!(outer.id(), current());

            inner.run(|| assert_eq!(inner.id(), current()));

            assert_eq!(outer.id(), current());
        });
    }

    #[test]
    fn run_returns_closure_result() {
        let routine = Routine::new();

        assert_eq!(routine.id(), routine.run(current));
    }

    #[test]
    fn wrapped_future_sees_routine_identity() {
        let future = scope(async { current() });
        let expected = future.routine_id();

        assert_eq!(expected, block_on(future));
        assert!(!is_entered());
    }

    #[test]
    fn multiplexed_routines_keep_identity_across_yields() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        let observed = Rc::new(RefCell::new(Vec::new()));

        let mut expected = Vec::new();

        for _ in 0..3 {
            let observed = Rc::clone(&observed);

            let future = scope(async move {
                for _ in 0..3 {
                    observed.borrow_mut().push(current());
                    yield_now().await;
                }
            });

            expected.push(future.routine_id());
            spawner.spawn_local(future).unwrap();
        }

        pool.run();

        let observed = observed.borrow();
        assert_eq!(9, observed.len());

        // Polls interleave but every observation belongs to one of the spawned routines,
        // each routine observed exactly once per iteration.
        for id in &expected {
            assert_eq!(3, observed.iter().filter(|x| *x == id).count());
        }

        // The routines yield to each other, so they cannot all run back-to-back.
        assert_ne!(observed[0], observed[1]);
    }

    #[test]
    fn nested_wrapped_futures_keep_identity_across_yields() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        let observed = Rc::new(RefCell::new(Vec::new()));

        let outer = {
            let observed = Rc::clone(&observed);

            scope(async move {
                let before = current();

                let inner = scope(async {
                    let first = current();
                    yield_now().await;
                    (first, current())
                });
                let inner_id = inner.routine_id();
                let (inner_first, inner_after) = inner.await;

                yield_now().await;

                observed
                    .borrow_mut()
                    .push((before, current(), inner_id, inner_first, inner_after));
            })
        };
        let outer_id = outer.routine_id();

        // A second routine interleaves with the first at every yield.
        spawner.spawn_local(outer).unwrap();
        spawner
            .spawn_local(scope(async {
                yield_now().await;
                yield_now().await;
            }))
            .unwrap();

        pool.run();

        let observed = observed.borrow();
        let (before, after, inner_id, inner_first, inner_after) = observed[0];

        assert_eq!(outer_id, before);
        assert_eq!(outer_id, after);
        assert_eq!(inner_id, inner_first);
        assert_eq!(inner_id, inner_after);
        assert!(!is_entered());
    }

    #[test]
    fn routine_identity_survives_move_to_other_thread() {
        let routine = Routine::new();
        let id = routine.id();

        let observed = thread::spawn(move || routine.run(current)).join().unwrap();

        assert_eq!(id, observed);
    }

    #[test]
    fn display_includes_value() {
        let routine = Routine::new();

        assert_eq!(
            format!("routine#{}", routine.id().value()),
            routine.id().to_string()
        );
    }

    #[test]
    fn routine_id_hash_impl() {
        let id = Routine::new().id();

        let mut mock_hasher = MockHasher::new();

        // We expect exactly 1 item to be written, which we consume as the raw hash value.
        mock_hasher.expect_write().times(1).returning(|_| ());

        id.hash(&mut mock_hasher);
    }

    #[test]
    fn routine_id_clone() {
        let id1 = Routine::new().id();
        let id2 = Clone::clone(&id1);

        assert_eq!(id1.hash, id2.hash);
        assert_eq!(id1.value, id2.value);
    }

    mock! {
        Hasher {}

        impl std::hash::Hasher for Hasher {
            fn finish(&self) -> u64;
            fn write(&mut self, bytes: &[u8]);
        }
    }
}
