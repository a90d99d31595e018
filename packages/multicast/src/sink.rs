//! Lifetime-bound ownership of subscriptions.

use std::fmt;
use std::mem;
use std::ops::AddAssign;
use std::sync::Arc;

use crate::SubscriptionHandle;

/// Reference-count operations on one handler, erased over the argument type of its channel.
trait SinkController: Send + Sync {
    fn add_ref(&self);
    fn release(&self);
}

impl<A> SinkController for SubscriptionHandle<A> {
    fn add_ref(&self) {
        self.add_sink_ref();
    }

    fn release(&self) {
        self.release_sink_ref();
    }
}

/// Keeps subscriptions registered for as long as it lives.
///
/// A sink holds one reference on each handler it was given. Cloning a sink adds a reference
/// to every handler it holds; dropping it releases them. When the last reference to a handler
/// is released, the handler is unsubscribed from its channel. Store a sink in the object whose
/// methods the handlers call, and the handlers go away together with the object.
///
/// Sinks outliving their channels is fine: releasing a reference on a destroyed channel does
/// nothing.
///
/// # Example
///
/// ```rust
/// use multicast::{AsyncEventQueue, Event, Sink};
///
/// let queue = AsyncEventQueue::new();
/// let clicked = Event::<()>::new(&queue);
/// let resized = Event::<(u32, u32)>::new(&queue);
///
/// let mut sink = Sink::from(clicked.subscribe(|()| println!("clicked")));
/// sink += resized.subscribe(|(width, height)| println!("{width}x{height}"));
///
/// assert_eq!(clicked.subscriber_count(), 1);
/// drop(sink);
/// assert_eq!(clicked.subscriber_count(), 0);
/// assert_eq!(resized.subscriber_count(), 0);
/// ```
#[derive(Default)]
pub struct Sink {
    controllers: Vec<Arc<dyn SinkController>>,
}

impl Sink {
    /// Creates a sink that holds nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference on the handler behind `handle` and holds it until the sink is dropped
    /// or cleared.
    pub fn push<A: 'static>(&mut self, handle: SubscriptionHandle<A>) {
        handle.add_sink_ref();
        self.controllers.push(Arc::new(handle));
    }

    /// Releases every reference held by the sink, leaving it empty.
    pub fn clear(&mut self) {
        for controller in mem::take(&mut self.controllers) {
            controller.release();
        }
    }

    /// Number of handler references held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether the sink holds no references.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

impl<A: 'static> From<SubscriptionHandle<A>> for Sink {
    fn from(handle: SubscriptionHandle<A>) -> Self {
        let mut sink = Self::new();
        sink.push(handle);
        sink
    }
}

impl<A: 'static> AddAssign<SubscriptionHandle<A>> for Sink {
    fn add_assign(&mut self, handle: SubscriptionHandle<A>) {
        self.push(handle);
    }
}

impl AddAssign<Self> for Sink {
    /// Takes over the references held by `other` without changing any reference count.
    fn add_assign(&mut self, mut other: Self) {
        self.controllers.append(&mut other.controllers);
    }
}

impl Clone for Sink {
    fn clone(&self) -> Self {
        for controller in &self.controllers {
            controller.add_ref();
        }

        Self {
            controllers: self.controllers.clone(),
        }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("len", &self.controllers.len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{AsyncEventQueue, Event};

    assert_impl_all!(Sink: Send, Sync, Clone);

    fn counting_event(queue: &AsyncEventQueue) -> (Event<u32>, Arc<AtomicUsize>) {
        (Event::new(queue), Arc::new(AtomicUsize::new(0)))
    }

    fn counter_handler(counter: &Arc<AtomicUsize>) -> impl Fn(&u32) + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn dropping_sink_unsubscribes() {
        let queue = AsyncEventQueue::new();
        let (event, counter) = counting_event(&queue);

        let sink = Sink::from(event.subscribe(counter_handler(&counter)));
        event.trigger(1);

        drop(sink);
        event.trigger(2);

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[test]
    fn two_sinks_on_same_handle_release_independently() {
        let queue = AsyncEventQueue::new();
        let (event, counter) = counting_event(&queue);

        let handle = event.subscribe(counter_handler(&counter));
        let first = Sink::from(handle.clone());
        let second = Sink::from(handle.clone());

        drop(first);
        assert!(handle.is_subscribed());
        event.trigger(1);

        drop(second);
        assert!(!handle.is_subscribed());
        event.trigger(2);

        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cloned_sink_keeps_handler_alive() {
        let queue = AsyncEventQueue::new();
        let (event, counter) = counting_event(&queue);

        let original = Sink::from(event.subscribe(counter_handler(&counter)));
        let copy = original.clone();

        drop(original);
        assert_eq!(event.subscriber_count(), 1);

        drop(copy);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[test]
    fn assignment_releases_old_handlers() {
        let queue = AsyncEventQueue::new();
        let (old_event, _) = counting_event(&queue);
        let (new_event, _) = counting_event(&queue);

        let mut sink = Sink::from(old_event.subscribe(|_| {}));
        assert_eq!(old_event.subscriber_count(), 1);
        assert_eq!(sink.len(), 1);

        sink = Sink::from(new_event.subscribe(|_| {}));

        assert_eq!(old_event.subscriber_count(), 0);
        assert_eq!(new_event.subscriber_count(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn add_assign_handle_accumulates() {
        let queue = AsyncEventQueue::new();
        let (first, _) = counting_event(&queue);
        let (second, _) = counting_event(&queue);

        let mut sink = Sink::new();
        assert!(sink.is_empty());

        sink += first.subscribe(|_| {});
        sink += second.subscribe(|_| {});
        assert_eq!(sink.len(), 2);

        sink.clear();
        assert!(sink.is_empty());
        assert_eq!(first.subscriber_count(), 0);
        assert_eq!(second.subscriber_count(), 0);
    }

    #[test]
    fn add_assign_sink_moves_references() {
        let queue = AsyncEventQueue::new();
        let (event, _) = counting_event(&queue);

        let mut target = Sink::new();
        let source = Sink::from(event.subscribe(|_| {}));

        target += source;
        assert_eq!(target.len(), 1);
        assert_eq!(event.subscriber_count(), 1);

        drop(target);
        assert_eq!(event.subscriber_count(), 0);
    }

    #[test]
    fn sink_outliving_channel_is_harmless() {
        let queue = AsyncEventQueue::new();
        let (event, _) = counting_event(&queue);

        let sink = Sink::from(event.subscribe(|_| {}));
        let copy = sink.clone();

        drop(event);
        drop(sink);
        drop(copy);
    }

    #[test]
    fn handler_without_sink_stays_registered() {
        let queue = AsyncEventQueue::new();
        let (event, _) = counting_event(&queue);

        let handle = event.subscribe(|_| {});
        drop(handle);

        assert_eq!(event.subscriber_count(), 1);
    }

    #[test]
    fn explicit_unsubscribe_then_sink_release_is_noop() {
        let queue = AsyncEventQueue::new();
        let (event, _) = counting_event(&queue);

        let handle = event.subscribe(|_| {});
        let sink = Sink::from(handle.clone());

        event.unsubscribe_handle(&handle);
        drop(sink);

        assert_eq!(event.subscriber_count(), 0);
    }
}
