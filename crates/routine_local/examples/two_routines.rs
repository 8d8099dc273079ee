//! Two routines each keep a private list of random numbers in a shared store. Each hands a closer
//! to the main thread, which cleans up after them.

use std::sync::mpsc;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use rand::Rng;
use routine_local::{routine, Closer, Store};
use tracing::{event, Level};

fn append_three(store: &Store<Vec<u32>>) -> Closer<Vec<u32>> {
    let mut values = store.load();

    for _ in 0..3 {
        values.push(rand::thread_rng().gen_range(0..10));
    }

    let mut sum = 0;
    for value in &values {
        sum += value;
        event!(Level::INFO, routine = %routine::current(), value, sum);
    }

    store.store(values);
    store.closer()
}

fn main() {
    routine_local_testing::init_test_worker();

    let store = Store::new(Vec::<u32>::new);
    let (closers_tx, closers_rx) = mpsc::channel();

    let mut pool = LocalPool::new();

    for _ in 0..2 {
        let store = store.clone();
        let closers_tx = closers_tx.clone();

        pool.spawner()
            .spawn_local(routine::scope(async move {
                let closer = append_three(&store);

                // Without a receiver, nobody else will clean up after this routine.
                if let Err(mpsc::SendError(closer)) = closers_tx.send(closer) {
                    event!(
                        Level::WARN,
                        routine = %closer.routine(),
                        "no supervisor to hand cleanup to, cleaning up in place"
                    );
                    closer.close();
                }
            }))
            .expect("the pool accepts new tasks until it is dropped");
    }

    pool.run();
    drop(closers_tx);

    // The main thread is a routine of its own.
    let own = append_three(&store);
    event!(Level::INFO, slots = store.slot_count(), "all routines finished");

    own.close();
    event!(Level::INFO, slots = store.slot_count(), "main thread cleaned up");

    for closer in closers_rx {
        closer.close();
        event!(Level::INFO, slots = store.slot_count(), routine = %closer.routine(), "routine cleaned up");
    }
}
