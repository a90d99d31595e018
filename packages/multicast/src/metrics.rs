//! Metrics for event delivery.
//!
//! The metrics use per-thread event instances to minimize contention.

use nm::{Event, Magnitude};

/// Histogram buckets for the number of handlers snapshotted by one synchronous dispatch.
const DISPATCH_HANDLERS_BUCKETS: &[Magnitude] = &[0, 1, 2, 4, 8, 16, 32, 64, 128];

thread_local! {
    /// Triggers that found a materialized channel, in any mode.
    pub(crate) static TRIGGERS: Event = Event::builder()
        .name("multicast_triggers")
        .build();

    /// Number of handlers snapshotted at the start of each synchronous dispatch.
    pub(crate) static DISPATCH_HANDLERS: Event = Event::builder()
        .name("multicast_dispatch_handlers")
        .histogram(DISPATCH_HANDLERS_BUCKETS)
        .build();

    /// Handlers invoked inline on the triggering thread.
    pub(crate) static HANDLER_INVOCATIONS: Event = Event::builder()
        .name("multicast_handler_invocations")
        .build();

    /// Handler calls marshaled to the thread that owns the handler.
    pub(crate) static MARSHALED_CALLS: Event = Event::builder()
        .name("multicast_marshaled_calls")
        .build();

    /// Marshaled calls executed by the owning thread's pump.
    pub(crate) static THREAD_CALLBACKS_RUN: Event = Event::builder()
        .name("multicast_thread_callbacks_run")
        .build();

    /// Deferred channel deliveries accepted by the async queue.
    pub(crate) static ASYNC_ENQUEUED: Event = Event::builder()
        .name("multicast_async_enqueued")
        .build();

    /// Deferred channel deliveries executed by a pump cycle.
    pub(crate) static ASYNC_DELIVERED: Event = Event::builder()
        .name("multicast_async_delivered")
        .build();

    /// Deferred channel deliveries skipped because their channel was destroyed first.
    pub(crate) static ASYNC_DISCARDED: Event = Event::builder()
        .name("multicast_async_discarded")
        .build();
}
