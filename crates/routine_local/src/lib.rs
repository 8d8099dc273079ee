// Copyright (c) Microsoft Corporation.

//! Routine-local storage: the equivalent of thread-local storage for lightweight tasks
//! ("routines") that are multiplexed onto a small number of threads.
//!
//! A [`Store`] holds at most one value per routine. The value is created by a factory the first
//! time a routine loads it and lives until it is explicitly removed, either by the routine itself
//! via [`Store::delete()`] or by anyone holding a [`Closer`] that the routine obtained earlier.
//!
//! Routines are identified via [`routine::current()`]. Code that runs outside any explicitly
//! entered [`routine::Routine`] uses the identity of its thread, so a store works like a
//! thread-local out of the box and becomes task-local once tasks are wrapped via
//! [`routine::scope()`].
//!
//! # Examples
//!
//! ```
//! use std::sync::mpsc;
//!
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//! use routine_local::{routine, Store};
//!
//! let store = Store::new(Vec::<u32>::new);
//! let (closers_tx, closers_rx) = mpsc::channel();
//!
//! let mut pool = LocalPool::new();
//!
//! for id in 0..2 {
//!     let store = store.clone();
//!     let closers_tx = closers_tx.clone();
//!
//!     pool.spawner()
//!         .spawn_local(routine::scope(async move {
//!             let mut values = store.load();
//!             values.push(id);
//!             store.store(values);
//!
//!             assert_eq!(vec![id], store.load());
//!
//!             // Cleanup is left to whoever receives the closer.
//!             closers_tx.send(store.closer()).unwrap();
//!         }))
//!         .unwrap();
//! }
//!
//! pool.run();
//! drop(closers_tx);
//!
//! assert_eq!(2, store.slot_count());
//!
//! for closer in closers_rx {
//!     closer.close();
//! }
//!
//! assert_eq!(0, store.slot_count());
//! ```

mod error;
mod store;
mod table;
mod with_data;

pub mod routine;

pub use error::*;
pub use store::*;
pub use with_data::*;
