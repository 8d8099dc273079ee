// Copyright (c) Microsoft Corporation.

use std::cell::Cell;

use tracing::level_filters::LevelFilter;

thread_local! {
    static TRACING_CONFIG_GUARD: Cell<Option<tracing::subscriber::DefaultGuard>> = const { Cell::new(None) };
}

/// Configures the calling test thread to write store diagnostics to stdout.
///
/// Each test thread gets its own subscriber so the slot lifecycle events of concurrently running
/// tests do not interleave in the output. Calling this more than once on the same thread replaces
/// the previous subscriber.
pub fn init_test_worker() {
    // Guards must be released in reverse order of creation, so the old one goes first.
    drop(TRACING_CONFIG_GUARD.take());

    let stdout_subscriber = tracing_subscriber::fmt()
        // Slot lifecycle events are emitted at TRACE, which is suppressed by default.
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .finish();

    let tracing_config = tracing::subscriber::set_default(stdout_subscriber);

    // The guard lives in a thread-local to keep the subscriber active until the thread ends.
    TRACING_CONFIG_GUARD.set(Some(tracing_config));
}
