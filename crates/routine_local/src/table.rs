// Copyright (c) Microsoft Corporation.

use std::collections::hash_map::Entry;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hash_hasher::HashedMap;
use tracing::{event, Level};

use crate::routine::RoutineId;
use crate::{Error, Result};

/// Creates the initial value of a slot.
pub(crate) type Factory<T> = Arc<dyn Fn() -> T + Send + Sync + 'static>;

// Slots are keyed by routine identity. The identity carries a precomputed hash, so the maps use a
// pass-through hasher. A map does not allocate until its first insertion.
type Partition<T> = HashedMap<RoutineId, T>;

/// The slots of one store, at most one per routine.
///
/// Slots are spread over one or more partitions by routine identity hash, each partition guarded
/// by its own lock. With a single partition, every operation is mutually exclusive with every
/// other operation on the table. All operations on a single slot are always mutually exclusive.
pub(crate) struct SlotTable<T> {
    partitions: Box<[Mutex<Partition<T>>]>,
}

impl<T> SlotTable<T> {
    pub fn new(partition_count: usize) -> Self {
        assert!(partition_count > 0, "a slot table needs at least one partition");

        Self {
            partitions: (0..partition_count)
                .map(|_| Mutex::new(Partition::default()))
                .collect(),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn lock(&self, routine: RoutineId) -> MutexGuard<'_, Partition<T>> {
        let index = (routine.precomputed_hash() % self.partitions.len() as u64) as usize;

        // A panic in a factory or in a caller-provided closure poisons the lock. The map itself is
        // never left half-updated (a value is only inserted once the factory returns) so we
        // can safely keep using it.
        self.partitions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up the slot of a routine, creating it via the factory if it does not exist, and
    /// executes a closure on the value in the slot.
    ///
    /// The factory and the closure are both called while holding the partition lock. They must
    /// not access the same table and should not block.
    pub fn get_or_create_with<F, R>(
        &self,
        routine: RoutineId,
        factory: Option<&Factory<T>>,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut partition = self.lock(routine);

        let value = match partition.entry(routine) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let factory = factory.ok_or(Error::NoFactory { routine })?;

                // Creating under the lock guarantees that there is at most one creation per slot.
                let value = factory();
                event!(Level::TRACE, message = "slot created", routine = routine.value());

                entry.insert(value)
            }
        };

        Ok(f(value))
    }

    pub fn get_or_create(&self, routine: RoutineId, factory: Option<&Factory<T>>) -> Result<T>
    where
        T: Clone,
    {
        self.get_or_create_with(routine, factory, |value| value.clone())
    }

    /// Sets the value in the slot of a routine, creating the slot if it does not exist.
    ///
    /// Returns the previous value, so the caller can drop it after the lock has been released.
    pub fn set(&self, routine: RoutineId, value: T) -> Option<T> {
        let previous = self.lock(routine).insert(routine, value);

        event!(
            Level::TRACE,
            message = "slot set",
            routine = routine.value(),
            replaced = previous.is_some()
        );

        previous
    }

    /// Removes the slot of a routine. Removing a slot that does not exist is a no-op.
    ///
    /// Returns the removed value, so the caller can drop it after the lock has been released.
    pub fn remove(&self, routine: RoutineId) -> Option<T> {
        let removed = self.lock(routine).remove(&routine);

        event!(
            Level::TRACE,
            message = "slot removed",
            routine = routine.value(),
            existed = removed.is_some()
        );

        removed
    }

    pub fn contains(&self, routine: RoutineId) -> bool {
        self.lock(routine).contains_key(&routine)
    }

    /// Obtains the number of slots in the table. For diagnostic purposes.
    ///
    /// Partitions are counted one at a time, so with concurrent activity in multiple partitions
    /// the result may not correspond to any single moment in time.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| {
                partition
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .sum()
    }
}

// This is deliberately not tested as we do not have a contract for what Debug::fmt() should
// return and have no need for such a contract.
impl<T> Debug for SlotTable<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("partitions", &self.partitions.len())
            .field("slots", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::routine::Routine;

    fn counting_factory() -> (Factory<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory_calls = Arc::clone(&calls);

        let factory: Factory<usize> =
            Arc::new(move || factory_calls.fetch_add(1, Ordering::Relaxed) + 100);

        (factory, calls)
    }

    #[test]
    fn get_or_create_calls_factory_once() {
        let table = SlotTable::new(1);
        let (factory, calls) = counting_factory();
        let routine = Routine::new().id();

        assert_eq!(100, table.get_or_create(routine, Some(&factory)).unwrap());
        assert_eq!(100, table.get_or_create(routine, Some(&factory)).unwrap());
        assert_eq!(1, calls.load(Ordering::Relaxed));
        assert_eq!(1, table.len());
    }

    #[test]
    fn get_or_create_without_factory_fails() {
        let table = SlotTable::<usize>::new(1);
        let routine = Routine::new().id();

        let error = table.get_or_create(routine, None).unwrap_err();
        assert!(matches!(error, Error::NoFactory { routine: r } if r == routine));
        assert_eq!(0, table.len());
    }

    #[test]
    fn get_or_create_without_factory_finds_existing() {
        let table = SlotTable::new(1);
        let routine = Routine::new().id();

        table.set(routine, 5);

        assert_eq!(5, table.get_or_create(routine, None).unwrap());
    }

    #[test]
    fn get_or_create_with_mutates_in_place() {
        let table = SlotTable::new(1);
        let (factory, _) = counting_factory();
        let routine = Routine::new().id();

        table
            .get_or_create_with(routine, Some(&factory), |value| *value += 1)
            .unwrap();

        assert_eq!(101, table.get_or_create(routine, None).unwrap());
    }

    #[test]
    fn set_overwrites() {
        let table = SlotTable::new(1);
        let routine = Routine::new().id();

        assert_eq!(None, table.set(routine, 1));
        assert_eq!(Some(1), table.set(routine, 2));
        assert_eq!(2, table.get_or_create(routine, None).unwrap());
        assert_eq!(1, table.len());
    }

    #[test]
    fn remove_is_idempotent() {
        let table = SlotTable::new(1);
        let routine = Routine::new().id();

        table.set(routine, 1);
        assert!(table.contains(routine));

        assert_eq!(Some(1), table.remove(routine));
        assert!(!table.contains(routine));

        assert_eq!(None, table.remove(routine));
        assert_eq!(0, table.len());
    }

    #[test]
    fn slots_are_independent() {
        let table = SlotTable::new(1);
        let a = Routine::new().id();
        let b = Routine::new().id();

        table.set(a, "a");
        table.set(b, "b");
        table.remove(a);

        assert!(!table.contains(a));
        assert_eq!("b", table.get_or_create(b, None).unwrap());
    }

    #[test]
    fn partitioned_table_counts_all_slots() {
        let table = SlotTable::new(4);
        assert_eq!(4, table.partition_count());

        let routines = (0..64).map(|_| Routine::new().id()).collect::<Vec<_>>();

        for (index, routine) in routines.iter().enumerate() {
            table.set(*routine, index);
        }

        assert_eq!(64, table.len());

        for (index, routine) in routines.iter().enumerate() {
            assert_eq!(index, table.get_or_create(*routine, None).unwrap());
        }

        for routine in &routines {
            table.remove(*routine);
        }

        assert_eq!(0, table.len());
    }

    #[test]
    fn survives_panicking_factory() {
        let table = SlotTable::<usize>::new(1);
        let routine = Routine::new().id();
        let factory: Factory<usize> = Arc::new(|| -> usize { panic!("factory failure") });

        let result = catch_unwind(AssertUnwindSafe(|| {
            table.get_or_create(routine, Some(&factory))
        }));
        assert!(result.is_err());

        // Nothing was inserted and the table remains usable.
        assert!(!table.contains(routine));

        table.set(routine, 7);
        assert_eq!(7, table.get_or_create(routine, None).unwrap());
    }

    #[test]
    #[should_panic]
    fn zero_partitions_panics() {
        _ = SlotTable::<usize>::new(0);
    }
}
