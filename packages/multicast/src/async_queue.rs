//! Deferred and cross-thread delivery service.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use foldhash::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::{ASYNC_DELIVERED, ASYNC_DISCARDED, ASYNC_ENQUEUED, THREAD_CALLBACKS_RUN};
use crate::{ChannelId, DestroyedFlag, Error, Result};

const DEFAULT_NAME: &str = "multicast";

/// A unit of deferred work accepted by [`AsyncEventQueue`].
pub type DeferredCallback = Box<dyn FnOnce() + Send + 'static>;

struct PendingEvent {
    channel: ChannelId,
    callback: DeferredCallback,
    destroyed: DestroyedFlag,
}

/// A call marshaled to one thread.
struct ThreadCallback {
    // Calls tagged with a channel are purged together with that channel's deliveries.
    channel: Option<ChannelId>,
    callback: DeferredCallback,
}

struct QueueInner {
    name: String,
    max_events_per_exec: Option<NonZero<usize>>,

    events: Mutex<VecDeque<PendingEvent>>,

    threaded_callbacks: Mutex<HashMap<ThreadId, Vec<ThreadCallback>>>,

    // Set whenever `threaded_callbacks` may be non-empty, so pumping threads can skip the
    // lock when no thread has marshaled anything.
    have_threaded_callbacks: AtomicBool,

    terminated: AtomicBool,
}

/// Service that defers event delivery to a later pump cycle and marshals calls onto the
/// threads that own the target handlers.
///
/// The queue never runs anything by itself. Some owner (typically the application's main
/// loop or a timer) calls [`exec()`][Self::exec] periodically on every thread that owns
/// handlers. Each call delivers the deferred channel triggers that are due and runs the
/// callbacks that other threads marshaled to the calling thread.
///
/// The queue is a cheaply cloneable handle; all clones refer to the same service. Construct
/// one at startup, pass it to every [`Event`][crate::Event] and call
/// [`terminate()`][Self::terminate] before process teardown.
///
/// # Example
///
/// ```rust
/// use multicast::{AsyncEventQueue, Event, TriggerType};
///
/// let queue = AsyncEventQueue::new();
/// let event = Event::<String>::new(&queue);
/// event.set_trigger_type(TriggerType::Asynchronous);
///
/// let _handle = event.subscribe(|message: &String| println!("{message}"));
///
/// // Returns immediately, nothing is delivered yet.
/// assert!(event.trigger("hello".to_string()));
///
/// // The next pump cycle delivers it.
/// assert!(queue.exec());
/// queue.terminate();
/// ```
#[derive(Clone)]
pub struct AsyncEventQueue {
    inner: Arc<QueueInner>,
}

impl AsyncEventQueue {
    /// Creates a queue with default settings.
    ///
    /// Use [`AsyncEventQueue::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the queue.
    #[must_use]
    pub fn builder() -> AsyncEventQueueBuilder {
        AsyncEventQueueBuilder::new()
    }

    /// The diagnostic name of the queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Records one deferred delivery for `channel`.
    ///
    /// The callback runs on whichever thread next calls [`exec()`][Self::exec], unless
    /// `destroyed` has been set by then, in which case it is dropped without running.
    ///
    /// Does nothing once the queue has been terminated.
    pub fn add(&self, channel: ChannelId, callback: DeferredCallback, destroyed: DestroyedFlag) {
        if self.is_terminated() {
            trace!(queue = %self.inner.name, %channel, "ignoring deferred delivery after termination");
            return;
        }

        self.inner.events.lock().push_back(PendingEvent {
            channel,
            callback,
            destroyed,
        });

        ASYNC_ENQUEUED.with(|event| event.observe_once());
        trace!(queue = %self.inner.name, %channel, "deferred delivery queued");
    }

    /// Drops every pending delivery for `channel`, together with the calls marshaled to
    /// other threads on behalf of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EventNotFound`] if nothing was pending for `channel`.
    pub fn remove(&self, channel: ChannelId) -> Result<()> {
        if self.purge(channel) == 0 {
            return Err(Error::EventNotFound { channel });
        }

        Ok(())
    }

    /// Drops everything queued on behalf of `channel`, returning how many callbacks were
    /// dropped.
    pub(crate) fn purge(&self, channel: ChannelId) -> usize {
        let removed_events = {
            let mut events = self.inner.events.lock();

            let (removed, kept): (VecDeque<_>, VecDeque<_>) = mem::take(&mut *events)
                .into_iter()
                .partition(|pending| pending.channel == channel);

            *events = kept;
            removed
        };

        let mut removed_calls = Vec::new();

        if self.inner.have_threaded_callbacks.load(Ordering::Acquire) {
            let mut threaded = self.inner.threaded_callbacks.lock();

            for callbacks in threaded.values_mut() {
                let (removed, kept): (Vec<_>, Vec<_>) = mem::take(callbacks)
                    .into_iter()
                    .partition(|queued| queued.channel == Some(channel));

                *callbacks = kept;
                removed_calls.extend(removed);
            }

            threaded.retain(|_, callbacks| !callbacks.is_empty());

            self.inner
                .have_threaded_callbacks
                .store(!threaded.is_empty(), Ordering::Release);
        }

        let count = removed_events.len().saturating_add(removed_calls.len());

        if count > 0 {
            trace!(
                queue = %self.inner.name,
                %channel,
                events = removed_events.len(),
                marshaled_calls = removed_calls.len(),
                "pending callbacks removed"
            );
        }

        // The callbacks may own arbitrary state (including other channels, whose teardown
        // calls back into this queue), so they are dropped only after the locks are released.
        drop(removed_events);
        drop(removed_calls);

        count
    }

    /// Whether any delivery or marshaled call is pending for `channel`.
    #[must_use]
    pub fn has(&self, channel: ChannelId) -> bool {
        let has_event = self
            .inner
            .events
            .lock()
            .iter()
            .any(|pending| pending.channel == channel);

        has_event
            || self
                .inner
                .threaded_callbacks
                .lock()
                .values()
                .flatten()
                .any(|queued| queued.channel == Some(channel))
    }

    /// Number of channel deliveries waiting for the next pump cycle.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.inner.events.lock().len()
    }

    /// Appends `callback` to the queue of `thread`. It runs when that thread next calls
    /// [`exec()`][Self::exec].
    ///
    /// A thread that never pumps again (for example because it has exited) never runs its
    /// callbacks. They are held until [`terminate()`][Self::terminate].
    ///
    /// Does nothing once the queue has been terminated.
    pub fn enqueue_to_thread(&self, thread: ThreadId, callback: DeferredCallback) {
        self.push_thread_callback(thread, ThreadCallback {
            channel: None,
            callback,
        });
    }

    /// Like [`enqueue_to_thread()`][Self::enqueue_to_thread] but on behalf of `channel`, so
    /// the call is dropped if the channel is removed before `thread` pumps.
    pub(crate) fn enqueue_channel_call(
        &self,
        thread: ThreadId,
        channel: ChannelId,
        callback: DeferredCallback,
    ) {
        self.push_thread_callback(thread, ThreadCallback {
            channel: Some(channel),
            callback,
        });
    }

    fn push_thread_callback(&self, thread: ThreadId, queued: ThreadCallback) {
        if self.is_terminated() {
            trace!(queue = %self.inner.name, ?thread, "ignoring marshaled call after termination");
            return;
        }

        self.inner
            .threaded_callbacks
            .lock()
            .entry(thread)
            .or_default()
            .push(queued);

        // Release pairs with the Acquire in `run_thread_callbacks()`.
        self.inner
            .have_threaded_callbacks
            .store(true, Ordering::Release);

        trace!(queue = %self.inner.name, ?thread, "call marshaled to thread");
    }

    /// Runs one pump cycle on the calling thread.
    ///
    /// Delivers the channel deliveries that were pending when the cycle started (up to the
    /// configured per-cycle limit) and then every callback marshaled to the calling thread.
    /// Deliveries queued while the cycle runs wait for the next cycle.
    ///
    /// Returns `true` if at least one callback ran.
    pub fn exec(&self) -> bool {
        if self.is_terminated() {
            return false;
        }

        let delivered = self.publish_events();
        let ran_thread_callbacks = self.run_thread_callbacks();

        delivered || ran_thread_callbacks
    }

    fn publish_events(&self) -> bool {
        let batch = mem::take(&mut *self.inner.events.lock());

        // Whatever this cycle does not get to, including when a callback unwinds, goes back
        // to the front of the queue in its original order.
        let mut batch = scopeguard::guard(batch, |unrun| {
            if unrun.is_empty() || self.is_terminated() {
                return;
            }

            let mut events = self.inner.events.lock();
            for pending in unrun.into_iter().rev() {
                events.push_front(pending);
            }
        });

        let mut delivered: usize = 0;

        loop {
            if self
                .inner
                .max_events_per_exec
                .is_some_and(|max| delivered >= max.get())
            {
                break;
            }

            if self.is_terminated() {
                break;
            }

            let Some(pending) = batch.pop_front() else {
                break;
            };

            if pending.destroyed.is_destroyed() {
                ASYNC_DISCARDED.with(|event| event.observe_once());
                trace!(queue = %self.inner.name, channel = %pending.channel, "discarding delivery for destroyed channel");
                continue;
            }

            (pending.callback)();
            delivered = delivered.saturating_add(1);

            ASYNC_DELIVERED.with(|event| event.observe_once());
        }

        delivered > 0
    }

    fn run_thread_callbacks(&self) -> bool {
        // Acquire pairs with the Release in `enqueue_to_thread()`.
        if !self.inner.have_threaded_callbacks.load(Ordering::Acquire) {
            return false;
        }

        let callbacks = {
            let mut threaded = self.inner.threaded_callbacks.lock();
            let callbacks = threaded.remove(&thread::current().id());

            self.inner
                .have_threaded_callbacks
                .store(!threaded.is_empty(), Ordering::Release);

            callbacks
        };

        let Some(callbacks) = callbacks else {
            return false;
        };

        trace!(queue = %self.inner.name, count = callbacks.len(), "running marshaled calls");

        for queued in callbacks {
            (queued.callback)();
            THREAD_CALLBACKS_RUN.with(|event| event.observe_once());
        }

        true
    }

    /// Stops all future delivery.
    ///
    /// Pending deliveries and marshaled calls are dropped without running, and later calls
    /// to [`add()`][Self::add] and [`enqueue_to_thread()`][Self::enqueue_to_thread] are
    /// ignored. Call this before process teardown so no delivery revives a channel that is
    /// being destroyed.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        let events = mem::take(&mut *self.inner.events.lock());
        let threaded = mem::take(&mut *self.inner.threaded_callbacks.lock());
        self.inner
            .have_threaded_callbacks
            .store(false, Ordering::Release);

        debug!(
            queue = %self.inner.name,
            dropped_events = events.len(),
            dropped_threads = threaded.len(),
            "async event queue terminated"
        );
    }

    /// Whether [`terminate()`][Self::terminate] has been called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }
}

impl Default for AsyncEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncEventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name", &self.inner.name)
            .field("pending_events", &self.pending_events())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring an [`AsyncEventQueue`].
#[derive(Debug)]
pub struct AsyncEventQueueBuilder {
    name: String,
    max_events_per_exec: Option<NonZero<usize>>,
}

impl AsyncEventQueueBuilder {
    fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            max_events_per_exec: None,
        }
    }

    /// Sets the name used to identify the queue in log output.
    ///
    /// Default is `"multicast"`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Limits how many channel deliveries a single [`AsyncEventQueue::exec()`] call runs.
    /// The remainder stays queued, in order, for later cycles.
    ///
    /// Default is unlimited.
    #[must_use]
    pub fn max_events_per_exec(mut self, max: NonZero<usize>) -> Self {
        self.max_events_per_exec = Some(max);
        self
    }

    /// Builds the queue with the configured settings.
    #[must_use]
    pub fn build(self) -> AsyncEventQueue {
        debug!(queue = %self.name, max_events_per_exec = ?self.max_events_per_exec, "async event queue created");

        AsyncEventQueue {
            inner: Arc::new(QueueInner {
                name: self.name,
                max_events_per_exec: self.max_events_per_exec,
                events: Mutex::new(VecDeque::new()),
                threaded_callbacks: Mutex::new(HashMap::default()),
                have_threaded_callbacks: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_utils::with_watchdog;

    assert_impl_all!(AsyncEventQueue: Send, Sync, Clone);

    fn counting(counter: &Arc<AtomicUsize>) -> DeferredCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn exec_on_empty_queue_does_nothing() {
        let queue = AsyncEventQueue::new();

        assert!(!queue.exec());
    }

    #[test]
    fn added_callback_runs_on_next_exec() {
        let queue = AsyncEventQueue::new();
        let channel = ChannelId::next();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add(channel, counting(&counter), DestroyedFlag::new());

        assert!(queue.has(channel));
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        assert!(queue.exec());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(!queue.has(channel));
    }

    #[test]
    fn destroyed_flag_suppresses_delivery() {
        let queue = AsyncEventQueue::new();
        let channel = ChannelId::next();
        let counter = Arc::new(AtomicUsize::new(0));
        let destroyed = DestroyedFlag::new();

        queue.add(channel, counting(&counter), destroyed.clone());
        destroyed.set();

        assert!(!queue.exec());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(queue.pending_events(), 0);
    }

    #[test]
    fn remove_drops_only_matching_channel() {
        let queue = AsyncEventQueue::new();
        let removed_channel = ChannelId::next();
        let kept_channel = ChannelId::next();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add(removed_channel, counting(&counter), DestroyedFlag::new());
        queue.add(kept_channel, counting(&counter), DestroyedFlag::new());
        queue.add(removed_channel, counting(&counter), DestroyedFlag::new());

        queue.remove(removed_channel).unwrap();

        assert!(!queue.has(removed_channel));
        assert!(queue.has(kept_channel));

        queue.exec();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_unknown_channel_is_reported() {
        let queue = AsyncEventQueue::new();
        let channel = ChannelId::next();

        let result = queue.remove(channel);

        assert!(matches!(result, Err(Error::EventNotFound { channel: c }) if c == channel));
    }

    #[test]
    fn delivery_order_is_fifo() {
        let queue = AsyncEventQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for value in 0..5 {
            let log = Arc::clone(&log);
            queue.add(
                ChannelId::next(),
                Box::new(move || log.lock().push(value)),
                DestroyedFlag::new(),
            );
        }

        queue.exec();

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn deliveries_added_during_exec_wait_for_next_cycle() {
        let queue = AsyncEventQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_counter = Arc::clone(&counter);
        queue.add(
            ChannelId::next(),
            Box::new(move || {
                inner_queue.add(
                    ChannelId::next(),
                    counting(&inner_counter),
                    DestroyedFlag::new(),
                );
            }),
            DestroyedFlag::new(),
        );

        queue.exec();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(queue.pending_events(), 1);

        queue.exec();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn max_events_per_exec_limits_cycle() {
        let queue = AsyncEventQueue::builder()
            .name("limited")
            .max_events_per_exec(NonZero::new(2).unwrap())
            .build();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        }

        queue.exec();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert_eq!(queue.pending_events(), 3);

        queue.exec();
        queue.exec();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert_eq!(queue.name(), "limited");
    }

    #[test]
    fn thread_callbacks_run_only_on_target_thread() {
        with_watchdog(|| {
            let queue = AsyncEventQueue::new();
            let counter = Arc::new(AtomicUsize::new(0));
            let (target_tx, target_rx) = mpsc::channel();
            let (queued_tx, queued_rx) = mpsc::channel::<()>();

            let target_queue = queue.clone();
            let target_counter = Arc::clone(&counter);
            let target = thread::spawn(move || {
                target_tx.send(thread::current().id()).unwrap();
                queued_rx.recv().unwrap();

                assert!(target_queue.exec());
                target_counter.load(Ordering::Relaxed)
            });

            let target_id = target_rx.recv().unwrap();
            queue.enqueue_to_thread(target_id, counting(&counter));

            // This thread has nothing marshaled to it.
            assert!(!queue.exec());
            assert_eq!(counter.load(Ordering::Relaxed), 0);

            queued_tx.send(()).unwrap();
            assert_eq!(target.join().unwrap(), 1);
        });
    }

    #[test]
    fn terminate_drops_pending_and_ignores_new_work() {
        let queue = AsyncEventQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.enqueue_to_thread(thread::current().id(), counting(&counter));

        queue.terminate();
        assert!(queue.is_terminated());

        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.enqueue_to_thread(thread::current().id(), counting(&counter));

        assert!(!queue.exec());
        assert_eq!(queue.pending_events(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn remove_drops_calls_marshaled_for_channel() {
        let queue = AsyncEventQueue::new();
        let channel = ChannelId::next();
        let other_channel = ChannelId::next();
        let payload = Arc::new(0_u8);

        // A thread that has exited never pumps again.
        let exited = thread::spawn(|| thread::current().id()).join().unwrap();

        for _ in 0..10 {
            let payload = Arc::clone(&payload);
            queue.enqueue_channel_call(exited, channel, Box::new(move || drop(payload)));
        }
        queue.enqueue_channel_call(exited, other_channel, Box::new(|| {}));

        assert!(queue.has(channel));
        assert_eq!(Arc::strong_count(&payload), 11);

        queue.remove(channel).unwrap();

        assert!(!queue.has(channel));
        assert!(queue.has(other_channel));
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn marshaled_calls_of_other_channels_survive_remove() {
        let queue = AsyncEventQueue::new();
        let removed_channel = ChannelId::next();
        let counter = Arc::new(AtomicUsize::new(0));
        let current = thread::current().id();

        queue.enqueue_channel_call(current, removed_channel, counting(&counter));
        queue.enqueue_channel_call(current, ChannelId::next(), counting(&counter));
        queue.enqueue_to_thread(current, counting(&counter));

        queue.remove(removed_channel).unwrap();

        assert!(queue.exec());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn panicking_delivery_leaves_rest_of_cycle_queued() {
        let queue = AsyncEventQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.add(
            ChannelId::next(),
            Box::new(|| panic!("delivery failed")),
            DestroyedFlag::new(),
        );
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());

        let result = panic::catch_unwind(AssertUnwindSafe(|| queue.exec()));

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pending_events(), 2);

        assert!(queue.exec());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn discarded_deliveries_do_not_count_toward_cycle_limit() {
        let queue = AsyncEventQueue::builder()
            .max_events_per_exec(NonZero::new(1).unwrap())
            .build();
        let counter = Arc::new(AtomicUsize::new(0));
        let destroyed = DestroyedFlag::new();
        destroyed.set();

        queue.add(ChannelId::next(), counting(&counter), destroyed.clone());
        queue.add(ChannelId::next(), counting(&counter), destroyed);
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());

        assert!(queue.exec());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pending_events(), 1);
    }

    #[test]
    fn terminate_during_exec_stops_cycle() {
        let queue = AsyncEventQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let terminating = queue.clone();
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());
        queue.add(
            ChannelId::next(),
            Box::new(move || terminating.terminate()),
            DestroyedFlag::new(),
        );
        queue.add(ChannelId::next(), counting(&counter), DestroyedFlag::new());

        assert!(queue.exec());

        assert!(queue.is_terminated());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pending_events(), 0);
    }

    #[test]
    fn debug_output_names_queue() {
        let queue = AsyncEventQueue::builder().name("ui").build();

        assert!(format!("{queue:?}").contains("ui"));
    }
}
