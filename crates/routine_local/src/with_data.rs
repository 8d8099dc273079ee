// Copyright (c) Microsoft Corporation.

/// Enables routine-local data to be accessed in place via reference within closures. This is an
/// alternative to the copy-out/copy-in style of `load()` and `store()`, useful when the stored
/// type is expensive to clone.
///
/// The lock guarding the data is held for the duration of the closure, blocking other routines
/// that use the same store. Keep the closures short and do not access the same store from inside
/// them (the lock is not re-entrant).
pub trait WithData<T> {
    /// Provides read access to the data of the calling routine for the duration of a closure,
    /// creating the data first if it does not exist yet.
    ///
    /// # Examples
    ///
    /// ```
    /// use routine_local::routine::Routine;
    /// use routine_local::{Store, WithData};
    ///
    /// let pending_requests = Store::new(Vec::<String>::new);
    ///
    /// let worker = Routine::new();
    /// worker.run(|| pending_requests.store(vec!["GET /".to_string()]));
    ///
    /// // Inspect without cloning the whole list out of the store.
    /// let first = worker.run(|| pending_requests.with(|requests| requests.first().cloned()));
    /// assert_eq!(Some("GET /".to_string()), first);
    ///
    /// // Any other routine sees its own, freshly created list.
    /// assert_eq!(0, pending_requests.with(Vec::len));
    /// ```
    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R;

    /// Provides mutable access to the data of the calling routine for the duration of a closure,
    /// creating the data first if it does not exist yet.
    ///
    /// Changes made by the closure are visible to subsequent accesses from the same routine
    /// without calling `store()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use routine_local::routine::Routine;
    /// use routine_local::{Store, WithData};
    ///
    /// let visited = Store::new(Vec::<u32>::new);
    /// let crawler_a = Routine::new();
    /// let crawler_b = Routine::new();
    ///
    /// crawler_a.run(|| visited.with_mut(|pages| pages.push(1)));
    /// crawler_b.run(|| visited.with_mut(|pages| pages.push(7)));
    /// crawler_a.run(|| visited.with_mut(|pages| pages.push(2)));
    ///
    /// assert_eq!(vec![1, 2], crawler_a.run(|| visited.load()));
    /// assert_eq!(vec![7], crawler_b.run(|| visited.load()));
    /// ```
    fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R;
}
