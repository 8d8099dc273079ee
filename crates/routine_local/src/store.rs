// Copyright (c) Microsoft Corporation.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use tracing::{event, Level};

use crate::routine::{self, RoutineId};
use crate::table::{Factory, SlotTable};
use crate::{Error, Result, WithData};

const DEFAULT_PARTITION_COUNT: usize = 1;

/// A storage pattern where every routine that uses the store sees its own independent value,
/// created on first use by a factory. This emulates thread-local storage for routines that are
/// multiplexed onto a small number of threads, where `thread_local!` cannot tell them apart. The
/// identity of the calling routine is resolved via [`routine::current()`].
///
/// Clones of a store share the same values. Separately created stores are fully independent.
///
/// # Value semantics
///
/// [`load()`][Self::load] returns a clone of the stored value. If the type has reference semantics
/// (e.g. `Arc<Mutex<U>>`), mutations through the returned value are visible to later loads. If
/// the type has value semantics (e.g. `Vec<U>`), the modified value must be written back via
/// [`store()`][Self::store], or modified in place via [`WithData::with_mut()`].
///
/// # Cleanup
///
/// Values are not removed automatically when a routine finishes. A routine must either call
/// [`delete()`][Self::delete] when it is done with its value or hand a [`Closer`] (obtained
/// from [`closer()`][Self::closer] while still running as that routine) to whoever performs the
/// cleanup. Otherwise, the value leaks for the lifetime of the store. Use
/// [`slot_count()`][Self::slot_count] to detect such leaks.
///
/// # Concurrency
///
/// All operations are thread-safe. Access to the values is serialized by a lock that is held for
/// the duration of each operation, including the factory call when a value is created. The
/// factory must therefore be quick and must not use the same store.
///
/// # Examples
///
/// ```
/// use std::thread;
/// use routine_local::Store;
///
/// let store = Store::new(Vec::<u32>::new);
///
/// let mut values = store.load();
/// values.push(1);
/// store.store(values);
///
/// let other = store.clone();
/// thread::spawn(move || {
///     // A different thread is a different routine, with its own value.
///     assert!(other.load().is_empty());
/// })
/// .join()
/// .unwrap();
///
/// assert_eq!(vec![1], store.load());
/// store.delete();
/// ```
pub struct Store<T>
where
    T: 'static,
{
    inner: Arc<StoreInner<T>>,
}

struct StoreInner<T>
where
    T: 'static,
{
    // If the calling routine has no value yet, we get the value from here.
    factory: Option<Factory<T>>,

    table: SlotTable<T>,
}

impl<T: 'static> Store<T> {
    /// Creates a store that uses the given factory to create the value of each routine.
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::from_parts(Some(Arc::new(factory)), DEFAULT_PARTITION_COUNT)
    }

    pub fn builder() -> StoreBuilder<T> {
        StoreBuilder::new()
    }

    fn from_parts(factory: Option<Factory<T>>, partition_count: usize) -> Self {
        event!(
            Level::DEBUG,
            message = "store created",
            value_type = std::any::type_name::<T>(),
            partitions = partition_count,
            has_factory = factory.is_some()
        );

        Self {
            inner: Arc::new(StoreInner {
                factory,
                table: SlotTable::new(partition_count),
            }),
        }
    }

    /// Returns the value of the calling routine, creating it via the factory if the routine does
    /// not have a value yet.
    ///
    /// Every call from the same routine returns an equal value until the value is replaced via
    /// [`store()`][Self::store] or removed via [`delete()`][Self::delete].
    ///
    /// # Panics
    ///
    /// Panics if the routine does not have a value yet and the store has no factory.
    /// Use [`try_load()`][Self::try_load] to handle this case as an error.
    pub fn load(&self) -> T
    where
        T: Clone,
    {
        self.try_load()
            .unwrap_or_else(|error| panic!("cannot load routine-local value: {error}"))
    }

    /// Returns the value of the calling routine, creating it via the factory if the routine does
    /// not have a value yet.
    ///
    /// Fails with [`Error::NoFactory`] if the routine does not have a value yet and the store
    /// has no factory.
    pub fn try_load(&self) -> Result<T>
    where
        T: Clone,
    {
        self.inner
            .table
            .get_or_create(routine::current(), self.inner.factory.as_ref())
    }

    /// Replaces the value of the calling routine.
    ///
    /// This is only necessary when the value has value semantics, in which case changes to a
    /// loaded value are not visible to the store until they are stored.
    pub fn store(&self, value: T) {
        // The previous value is dropped here, after the lock has been released.
        _ = self.inner.table.set(routine::current(), value);
    }

    /// Removes the value of the calling routine. Does nothing if there is no value.
    ///
    /// This removes the value of whichever routine calls it. Calling it from a routine other than
    /// the one that owns the value leaves that value in place and removes the caller's own value
    /// instead. When the owning routine cannot call this itself, it should obtain a [`Closer`]
    /// via [`closer()`][Self::closer] and hand it to whoever performs the cleanup.
    pub fn delete(&self) {
        _ = self.inner.table.remove(routine::current());
    }

    /// Returns a handle that removes the value of the calling routine when closed, no matter which
    /// routine or thread closes it.
    ///
    /// The identity of the calling routine is captured now, not when the handle is closed.
    pub fn closer(&self) -> Closer<T> {
        Closer {
            store: Arc::clone(&self.inner),
            routine: routine::current(),
        }
    }

    /// Returns `true` if the calling routine has a value in this store.
    pub fn is_present(&self) -> bool {
        self.inner.table.contains(routine::current())
    }

    /// Obtains the number of routines that have a value in this store. For diagnostic purposes.
    pub fn slot_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn partition_count(&self) -> usize {
        self.inner.table.partition_count()
    }

    fn with_value<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.inner
            .table
            .get_or_create_with(routine::current(), self.inner.factory.as_ref(), f)
            .unwrap_or_else(|error| panic!("cannot access routine-local value: {error}"))
    }
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    /// If there is a thread-safe cloneable initial value, every routine can start from a clone of
    /// it. This is a convenience method for the common case where the initial value is a simple
    /// cloneable value.
    pub fn with_initial_value(initial_value: T) -> Self {
        Self::new(move || initial_value.clone())
    }
}

impl<T: 'static> WithData<T> for Store<T> {
    /// # Panics
    ///
    /// Panics if the routine does not have a value yet and the store has no factory.
    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        self.with_value(|value| f(value))
    }

    /// # Panics
    ///
    /// Panics if the routine does not have a value yet and the store has no factory.
    fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.with_value(f)
    }
}

impl<T: 'static> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Debug for Store<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field(
                "factory",
                &self
                    .inner
                    .factory
                    .as_ref()
                    .map(|_| format!("Fn() -> {}", std::any::type_name::<T>())),
            )
            .field("table", &self.inner.table)
            .finish()
    }
}

/// Configures and creates a [`Store`].
///
/// # Examples
///
/// ```
/// use routine_local::Store;
///
/// let store = Store::builder()
///     .factory(|| 0_u64)
///     .partitions(8)
///     .build()
///     .unwrap();
///
/// assert_eq!(0, store.load());
/// ```
pub struct StoreBuilder<T>
where
    T: 'static,
{
    factory: Option<Factory<T>>,
    partitions: usize,
}

impl<T: 'static> StoreBuilder<T> {
    pub fn new() -> Self {
        Self {
            factory: None,
            partitions: DEFAULT_PARTITION_COUNT,
        }
    }

    /// Sets the function that creates the value of a routine on first access.
    ///
    /// Without a factory, values can only be created via [`Store::store()`] and loading the
    /// value of a routine that has not stored one is a configuration error.
    ///
    /// The factory is called while holding the lock of the store. It must not access the same store
    /// and should not block.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Splits the store into independently locked partitions, reducing lock contention when many
    /// routines access the store concurrently. Routines are assigned to partitions by identity.
    ///
    /// Defaults to 1, in which case all operations on the store are mutually exclusive.
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn build(self) -> Result<Store<T>> {
        if self.partitions == 0 {
            return Err(Error::InvalidOptions(
                "a store needs at least one partition".to_string(),
            ));
        }

        Ok(Store::from_parts(self.factory, self.partitions))
    }
}

impl<T: 'static> Default for StoreBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Debug for StoreBuilder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("has_factory", &self.factory.is_some())
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// Removes the value of a specific routine from a [`Store`] when closed.
///
/// Obtained from [`Store::closer()`] by the routine that owns the value. The handle can be sent to
/// and closed from any routine or thread, for example by a supervisor that cleans up after routines
/// that end without running any further code. Prefer [`Store::delete()`] when the owning routine
/// can do the cleanup itself.
///
/// Closing more than once is harmless. The handle keeps the store alive.
pub struct Closer<T>
where
    T: 'static,
{
    store: Arc<StoreInner<T>>,
    routine: RoutineId,
}

impl<T: 'static> Closer<T> {
    /// Removes the value of the routine that created this handle. Does nothing if there is no
    /// value, e.g. because the handle was already closed.
    pub fn close(&self) {
        event!(
            Level::TRACE,
            message = "closer invoked",
            routine = self.routine.value(),
            invoker = routine::current().value()
        );

        _ = self.store.table.remove(self.routine);
    }

    /// The routine whose value this handle removes.
    pub fn routine(&self) -> RoutineId {
        self.routine
    }

    /// Converts the handle into a plain cleanup function.
    pub fn into_fn(self) -> impl Fn() + Send + Sync + 'static
    where
        T: Send,
    {
        move || self.close()
    }
}

impl<T: 'static> Clone for Closer<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            routine: self.routine,
        }
    }
}

impl<T: 'static> Debug for Closer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("routine", &self.routine)
            .field("value_type", &std::any::type_name::<T>())
            .finish()
    }
}
