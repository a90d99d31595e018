//! The publish/subscribe endpoint.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::instance::ChannelInstance;
use crate::{AsyncEventQueue, ChannelId, DedupKey, SubscriptionHandle, TriggerType};

/// A typed publish/subscribe channel delivering `A` to every subscribed handler.
///
/// Handlers receive the arguments by reference. Channels with several arguments use a tuple
/// for `A`.
///
/// # Delivery
///
/// [`trigger()`][Self::trigger] delivers according to the configured [`TriggerType`]:
///
/// * Synchronous (the default) - handlers are invoked inline, in subscription order. A handler
///   may call [`accept()`][Self::accept] to consume the event, which skips the remaining
///   handlers and makes `trigger()` return `false`.
/// * Asynchronous - `trigger()` returns immediately and the channel's [`AsyncEventQueue`]
///   performs the synchronous delivery during its next pump cycle.
///
/// Every handler is bound to the thread that subscribed it. When a channel is triggered on
/// another thread, the call is marshaled through the [`AsyncEventQueue`] and runs when the
/// subscribing thread next pumps the queue. Use
/// [`SubscriptionHandle::detach_affinity()`] for handlers that may run on any thread.
///
/// A marshaled call looks its handler up again when it runs and is skipped if the handler
/// has been unsubscribed in the meantime. Calls queued for a thread that never pumps again
/// are held until the channel is cleared or dropped, or the queue is terminated.
///
/// # Reentrancy
///
/// Handlers may freely subscribe, unsubscribe, trigger or [`clear()`][Self::clear] the
/// channel they are called from:
///
/// * Handlers subscribed during a trigger are not called by that trigger.
/// * Handlers unsubscribed during a trigger are not called by it anymore.
/// * If the channel is cleared or dropped during a trigger, the trigger stops after the
///   current handler returns and reports `false`.
///
/// # Lifetime
///
/// A channel allocates no state until the first subscription or configuration call. Dropping
/// the channel unsubscribes every handler and cancels its pending asynchronous deliveries.
/// Outstanding [`SubscriptionHandle`]s and [`Sink`][crate::Sink]s become inert.
///
/// # Example
///
/// ```rust
/// use multicast::{AsyncEventQueue, Event};
///
/// let queue = AsyncEventQueue::new();
/// let text_changed = Event::<String>::new(&queue);
///
/// let _handle = text_changed.subscribe(|text: &String| println!("text is now {text}"));
///
/// assert!(text_changed.trigger("hello".to_string()));
/// ```
pub struct Event<A> {
    queue: AsyncEventQueue,

    // Created on first use. Replaced with `None` when the channel is cleared.
    instance: Mutex<Option<Arc<ChannelInstance<A>>>>,
}

impl<A> Event<A>
where
    A: Clone + Send + 'static,
{
    /// Creates a channel that uses `queue` for deferred and cross-thread delivery.
    #[must_use]
    pub fn new(queue: &AsyncEventQueue) -> Self {
        Self {
            queue: queue.clone(),
            instance: Mutex::new(None),
        }
    }

    /// Subscribes `handler`, appending it after all existing handlers.
    ///
    /// The handler is bound to the calling thread. The returned handle does not keep the
    /// handler subscribed; the handler stays registered until it is explicitly unsubscribed,
    /// the last [`Sink`][crate::Sink] referencing it is dropped or the channel is destroyed.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let instance = self.instance();
        let id = instance.subscribe(Arc::new(handler), None);

        SubscriptionHandle::new(&instance, id)
    }

    /// Subscribes `handler` under `key`.
    ///
    /// If a handler is already registered under `key`, its callback is replaced with `handler`
    /// and it keeps its position, thread affinity and sink references. Otherwise this behaves
    /// like [`subscribe()`][Self::subscribe].
    pub fn subscribe_keyed<F>(&self, key: DedupKey, handler: F) -> SubscriptionHandle<A>
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let instance = self.instance();
        let id = instance.subscribe(Arc::new(handler), Some(key));

        SubscriptionHandle::new(&instance, id)
    }

    /// Unsubscribes the handler registered under `key`, if any.
    ///
    /// If the channel is being triggered, the handler is not called by the rest of that
    /// trigger.
    pub fn unsubscribe(&self, key: DedupKey) {
        if let Some(instance) = self.existing_instance() {
            instance.unsubscribe_key(key);
        }
    }

    /// Unsubscribes the handler referenced by `handle`, if it is still registered with this
    /// channel.
    ///
    /// If the channel is being triggered, the handler is not called by the rest of that
    /// trigger.
    pub fn unsubscribe_handle(&self, handle: &SubscriptionHandle<A>) {
        if let Some(instance) = self.existing_instance() {
            if handle.belongs_to(&instance) {
                instance.unsubscribe(handle.id());
            }
        }
    }

    /// Delivers `args` to the subscribed handlers according to the configured
    /// [`TriggerType`].
    ///
    /// Returns `false` if a handler accepted the event or the channel was destroyed during
    /// delivery, `true` otherwise. A channel without subscribers returns `true`. Asynchronous
    /// triggers always return `true`.
    pub fn trigger(&self, args: A) -> bool {
        match self.existing_instance() {
            Some(instance) => instance.trigger(args),
            None => true,
        }
    }

    /// Delivers `args` inline to the subscribed handlers, regardless of the configured
    /// [`TriggerType`].
    ///
    /// Handlers bound to other threads are marshaled to them and do not run before this
    /// returns.
    ///
    /// Returns `false` if a handler accepted the event or the channel was destroyed during
    /// delivery, `true` otherwise.
    pub fn sync_trigger(&self, args: &A) -> bool {
        match self.existing_instance() {
            Some(instance) => instance.sync_trigger(args),
            None => true,
        }
    }

    /// Queues a synchronous delivery of `args` for the next pump cycle of the channel's
    /// [`AsyncEventQueue`], regardless of the configured [`TriggerType`].
    pub fn async_trigger(&self, args: A) {
        if let Some(instance) = self.existing_instance() {
            instance.async_trigger(args);
        }
    }

    /// Marks the event as consumed. Only meaningful when called by a handler: the trigger
    /// that invoked it skips the remaining handlers and returns `false`.
    pub fn accept(&self) {
        if let Some(instance) = self.existing_instance() {
            instance.accept();
        }
    }

    /// Clears an earlier [`accept()`][Self::accept] made during the current trigger.
    pub fn ignore(&self) {
        if let Some(instance) = self.existing_instance() {
            instance.ignore();
        }
    }

    /// The configured delivery mode.
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        self.existing_instance()
            .map_or(TriggerType::Default, |instance| instance.trigger_type())
    }

    /// Configures how [`trigger()`][Self::trigger] delivers.
    pub fn set_trigger_type(&self, trigger_type: TriggerType) {
        self.instance().set_trigger_type(trigger_type);
    }
}

impl<A> Event<A> {
    /// Destroys the current channel state as if the channel had been dropped, leaving a
    /// fresh, unconfigured channel in its place.
    ///
    /// Every handler is unsubscribed, pending asynchronous deliveries are cancelled and
    /// outstanding handles and sinks become inert. A trigger in progress stops after its
    /// current handler returns.
    pub fn clear(&self) {
        // Taken out first so the teardown does not run under our lock.
        let instance = self.instance.lock().take();

        if let Some(instance) = instance {
            instance.destroy();
        }
    }

    /// Whether the channel has allocated its state, which happens on the first subscription
    /// or configuration call.
    #[must_use]
    pub fn has_instance(&self) -> bool {
        self.instance.lock().is_some()
    }

    /// Identity of the current channel state, as used by the [`AsyncEventQueue`].
    ///
    /// Returns `None` if the channel has not allocated its state.
    #[must_use]
    pub fn id(&self) -> Option<ChannelId> {
        self.existing_instance().map(|instance| instance.id())
    }

    /// Number of handlers currently subscribed.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.existing_instance()
            .map_or(0, |instance| instance.handler_count())
    }

    fn existing_instance(&self) -> Option<Arc<ChannelInstance<A>>> {
        self.instance.lock().clone()
    }

    fn instance(&self) -> Arc<ChannelInstance<A>> {
        let mut instance = self.instance.lock();

        Arc::clone(instance.get_or_insert_with(|| {
            Arc::new(ChannelInstance::new(self.queue.clone()))
        }))
    }
}

impl<A> Drop for Event<A> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.get_mut().take() {
            instance.destroy();
        }
    }
}

impl<A> fmt::Debug for Event<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("queue", &self.queue.name())
            .field("instance", &self.instance)
            .finish()
    }
}
