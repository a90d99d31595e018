use std::fmt;
use std::ptr;
use std::sync::{Arc, Weak};

use crate::instance::ChannelInstance;
use crate::HandlerId;

/// Capability referencing one handler registered with an [`Event`][crate::Event].
///
/// The handle does not keep the handler registered and does not keep the channel alive. Every
/// operation first checks that the channel still exists and silently does nothing if it does
/// not.
///
/// Put the handle into a [`Sink`][crate::Sink] to have the handler unsubscribed automatically
/// when the sink is dropped.
pub struct SubscriptionHandle<A> {
    instance: Weak<ChannelInstance<A>>,
    id: HandlerId,
}

impl<A> SubscriptionHandle<A> {
    pub(crate) fn new(instance: &Arc<ChannelInstance<A>>, id: HandlerId) -> Self {
        Self {
            instance: Arc::downgrade(instance),
            id,
        }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    /// The channel instance, if it has not been destroyed.
    pub(crate) fn live_instance(&self) -> Option<Arc<ChannelInstance<A>>> {
        self.instance
            .upgrade()
            .filter(|instance| !instance.is_destroyed())
    }

    pub(crate) fn belongs_to(&self, instance: &Arc<ChannelInstance<A>>) -> bool {
        ptr::eq(self.instance.as_ptr(), Arc::as_ptr(instance))
    }

    /// Whether the channel this handle was issued by still exists.
    #[must_use]
    pub fn is_channel_alive(&self) -> bool {
        self.live_instance().is_some()
    }

    /// Whether the handler is still registered with a live channel.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.live_instance()
            .is_some_and(|instance| instance.contains(self.id))
    }

    /// Removes the handler from its channel. Does nothing if it is already gone.
    pub fn unsubscribe(&self) {
        if let Some(instance) = self.live_instance() {
            instance.unsubscribe(self.id);
        }
    }

    /// Clears the thread affinity of the handler, so future deliveries invoke it inline on
    /// whichever thread triggers the channel instead of marshaling to the subscribing thread.
    ///
    /// # Example
    ///
    /// ```rust
    /// use multicast::{AsyncEventQueue, Event, Sink};
    ///
    /// let queue = AsyncEventQueue::new();
    /// let event = Event::<u32>::new(&queue);
    ///
    /// let _sink = Sink::from(event.subscribe(|_| {}).detach_affinity());
    /// ```
    #[must_use]
    pub fn detach_affinity(self) -> Self {
        if let Some(instance) = self.live_instance() {
            instance.detach_affinity(self.id);
        }

        self
    }

    pub(crate) fn add_sink_ref(&self) {
        if let Some(instance) = self.live_instance() {
            instance.add_sink_ref(self.id);
        }
    }

    pub(crate) fn release_sink_ref(&self) {
        if let Some(instance) = self.live_instance() {
            instance.release_sink_ref(self.id);
        }
    }
}

impl<A> Clone for SubscriptionHandle<A> {
    fn clone(&self) -> Self {
        Self {
            instance: Weak::clone(&self.instance),
            id: self.id,
        }
    }
}

impl<A> fmt::Debug for SubscriptionHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel_alive", &self.is_channel_alive())
            .finish()
    }
}
