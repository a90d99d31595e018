//! Materialized state of one channel and the synchronous dispatch algorithm.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::{DISPATCH_HANDLERS, HANDLER_INVOCATIONS, MARSHALED_CALLS, TRIGGERS};
use crate::registry::{Callback, HandlerEntry, HandlerRegistry};
use crate::{AsyncEventQueue, ChannelId, DedupKey, DestroyedFlag, HandlerId, TriggerType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct DispatchId(u64);

/// One synchronous dispatch in progress.
#[derive(Debug)]
struct Dispatch {
    id: DispatchId,

    /// The thread running the dispatch. `accept()` and `ignore()` act on the innermost
    /// dispatch of the calling thread.
    thread: ThreadId,

    /// Handlers snapshotted at the start of the dispatch that have not been delivered to yet.
    pending: VecDeque<HandlerId>,

    accepted: bool,
}

struct InstanceState<A> {
    registry: HandlerRegistry<A>,
    trigger_type: TriggerType,

    // Every synchronous dispatch currently running against this channel, oldest first.
    // There is more than one when handlers trigger the channel again or when several
    // threads trigger it at the same time.
    dispatches: Vec<Dispatch>,

    next_dispatch_id: u64,
}

impl<A> fmt::Debug for InstanceState<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceState")
            .field("registry", &self.registry)
            .field("trigger_type", &self.trigger_type)
            .field("dispatches", &self.dispatches)
            .finish_non_exhaustive()
    }
}

impl<A> InstanceState<A> {
    /// Removes the handler from the registry and from every in-flight dispatch.
    ///
    /// The removed entry is returned so the caller can drop it after releasing the lock.
    fn remove_handler(&mut self, id: HandlerId) -> Option<HandlerEntry<A>> {
        let entry = self.registry.remove(id)?;

        for dispatch in &mut self.dispatches {
            dispatch.pending.retain(|pending| *pending != id);
        }

        Some(entry)
    }

    fn dispatch_mut(&mut self, id: DispatchId) -> Option<&mut Dispatch> {
        self.dispatches.iter_mut().find(|dispatch| dispatch.id == id)
    }

    fn innermost_dispatch_mut(&mut self, thread: ThreadId) -> Option<&mut Dispatch> {
        self.dispatches
            .iter_mut()
            .rev()
            .find(|dispatch| dispatch.thread == thread)
    }
}

/// The state behind an [`Event`][crate::Event] once something has subscribed to it or
/// configured it.
///
/// Subscription handles hold a weak reference to this type. Dispatch holds a strong one for
/// its duration, so the state stays valid even if the channel is destroyed by one of its own
/// handlers; the destroyed flag tells the dispatch to stop.
pub(crate) struct ChannelInstance<A> {
    id: ChannelId,
    queue: AsyncEventQueue,
    destroyed: DestroyedFlag,
    state: Mutex<InstanceState<A>>,
}

impl<A> ChannelInstance<A> {
    pub(crate) fn new(queue: AsyncEventQueue) -> Self {
        let id = ChannelId::next();
        trace!(channel = %id, queue = queue.name(), "channel instance created");

        Self {
            id,
            queue,
            destroyed: DestroyedFlag::new(),
            state: Mutex::new(InstanceState {
                registry: HandlerRegistry::new(),
                trigger_type: TriggerType::Default,
                dispatches: Vec::new(),
                next_dispatch_id: 0,
            }),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.is_destroyed()
    }

    pub(crate) fn subscribe(&self, callback: Callback<A>, key: Option<DedupKey>) -> HandlerId {
        let affinity = Some(thread::current().id());

        let (id, replaced) = self.state.lock().registry.insert(callback, key, affinity);

        if replaced.is_some() {
            trace!(channel = %self.id, ?key, "handler replaced");
        } else {
            trace!(channel = %self.id, ?key, "handler subscribed");
        }

        id
    }

    pub(crate) fn unsubscribe(&self, id: HandlerId) -> bool {
        let removed = self.state.lock().remove_handler(id);

        if removed.is_some() {
            trace!(channel = %self.id, "handler unsubscribed");
        }

        removed.is_some()
    }

    pub(crate) fn unsubscribe_key(&self, key: DedupKey) -> bool {
        let removed = {
            let mut state = self.state.lock();

            state
                .registry
                .id_for_key(key)
                .and_then(|id| state.remove_handler(id))
        };

        if removed.is_some() {
            trace!(channel = %self.id, ?key, "handler unsubscribed");
        }

        removed.is_some()
    }

    pub(crate) fn contains(&self, id: HandlerId) -> bool {
        self.state.lock().registry.contains(id)
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub(crate) fn detach_affinity(&self, id: HandlerId) {
        if let Some(entry) = self.state.lock().registry.get_mut(id) {
            entry.affinity = None;
        }
    }

    pub(crate) fn add_sink_ref(&self, id: HandlerId) {
        if let Some(entry) = self.state.lock().registry.get_mut(id) {
            entry.sink_refs = entry
                .sink_refs
                .checked_add(1)
                .expect("sink reference count overflow");
        }
    }

    /// Drops one sink reference, unsubscribing the handler when it was the last one.
    pub(crate) fn release_sink_ref(&self, id: HandlerId) {
        let removed = {
            let mut state = self.state.lock();

            let Some(entry) = state.registry.get_mut(id) else {
                return;
            };

            entry.sink_refs = entry.sink_refs.checked_sub(1).expect(
                "sink reference count underflow - a sink released a reference it never added",
            );

            if entry.sink_refs == 0 {
                state.remove_handler(id)
            } else {
                None
            }
        };

        if removed.is_some() {
            trace!(channel = %self.id, "last sink released, handler unsubscribed");
        }
    }

    pub(crate) fn trigger_type(&self) -> TriggerType {
        self.state.lock().trigger_type
    }

    pub(crate) fn set_trigger_type(&self, trigger_type: TriggerType) {
        self.state.lock().trigger_type = trigger_type;
    }

    pub(crate) fn accept(&self) {
        let current = thread::current().id();

        match self.state.lock().innermost_dispatch_mut(current) {
            Some(dispatch) => dispatch.accepted = true,
            None => trace!(channel = %self.id, "accept() outside of a dispatch ignored"),
        }
    }

    pub(crate) fn ignore(&self) {
        let current = thread::current().id();

        if let Some(dispatch) = self.state.lock().innermost_dispatch_mut(current) {
            dispatch.accepted = false;
        }
    }

    /// Marks the instance destroyed, purges its pending deferred deliveries and marshaled
    /// calls and drops its handlers. A dispatch that is still running stops after its current handler returns.
    pub(crate) fn destroy(&self) {
        self.destroyed.set();

        let purged = self.queue.purge(self.id);
        if purged > 0 {
            trace!(channel = %self.id, purged, "pending deliveries purged");
        }

        let registry = {
            let mut state = self.state.lock();

            for dispatch in &mut state.dispatches {
                dispatch.pending.clear();
            }

            mem::replace(&mut state.registry, HandlerRegistry::new())
        };

        debug!(channel = %self.id, handlers = registry.len(), "channel destroyed");
    }
}

impl<A> ChannelInstance<A>
where
    A: Clone + Send + 'static,
{
    pub(crate) fn trigger(self: &Arc<Self>, args: A) -> bool {
        TRIGGERS.with(|event| event.observe_once());

        if self.trigger_type().is_deferred() {
            self.async_trigger(args);
            true
        } else {
            self.sync_trigger(&args)
        }
    }

    pub(crate) fn async_trigger(self: &Arc<Self>, args: A) {
        let instance = Arc::downgrade(self);

        self.queue.add(
            self.id,
            Box::new(move || {
                if let Some(instance) = instance.upgrade() {
                    instance.sync_trigger(&args);
                }
            }),
            self.destroyed.clone(),
        );
    }

    /// Delivers `args` to every handler registered when the call starts, in registration
    /// order.
    ///
    /// Returns `false` if a handler accepted the event or destroyed the channel.
    pub(crate) fn sync_trigger(self: &Arc<Self>, args: &A) -> bool {
        let current = thread::current().id();

        let (dispatch_id, handler_count) = {
            let mut state = self.state.lock();

            let pending: VecDeque<HandlerId> = state.registry.ids().collect();
            let handler_count = pending.len();

            let id = DispatchId(state.next_dispatch_id);
            state.next_dispatch_id = state.next_dispatch_id.wrapping_add(1);

            state.dispatches.push(Dispatch {
                id,
                thread: current,
                pending,
                accepted: false,
            });

            (id, handler_count)
        };

        DISPATCH_HANDLERS.with(|event| event.observe(handler_count));
        trace!(channel = %self.id, handlers = handler_count, "synchronous dispatch started");

        // The frame is removed however we leave, including a handler unwinding.
        let _frame = scopeguard::guard(dispatch_id, |dispatch_id| {
            self.state
                .lock()
                .dispatches
                .retain(|dispatch| dispatch.id != dispatch_id);
        });

        loop {
            let next = {
                let mut state = self.state.lock();
                let InstanceState {
                    registry,
                    dispatches,
                    ..
                } = &mut *state;

                let Some(handler) = dispatches
                    .iter_mut()
                    .find(|dispatch| dispatch.id == dispatch_id)
                    .and_then(|dispatch| dispatch.pending.pop_front())
                else {
                    break;
                };

                registry
                    .get(handler)
                    .map(|entry| (handler, entry.affinity, Arc::clone(&entry.callback)))
            };

            let Some((handler, affinity, callback)) = next else {
                continue;
            };

            match affinity {
                Some(owner) if owner != current => self.marshal(owner, handler, args),
                _ => {
                    callback(args);
                    HANDLER_INVOCATIONS.with(|event| event.observe_once());
                }
            }

            if self.destroyed.is_destroyed() {
                trace!(channel = %self.id, "channel destroyed during dispatch");
                return false;
            }

            let accepted = {
                let mut state = self.state.lock();

                match state.dispatch_mut(dispatch_id) {
                    Some(dispatch) if dispatch.accepted => {
                        dispatch.pending.clear();
                        dispatch.accepted = false;
                        true
                    }
                    _ => false,
                }
            };

            if accepted {
                trace!(channel = %self.id, "event accepted, remaining handlers skipped");
                return false;
            }
        }

        true
    }

    /// Queues the call for the thread that owns the handler.
    ///
    /// The handler is looked up again when the call runs, so a handler unsubscribed in the
    /// meantime is not invoked and a replaced one runs with its current callback.
    fn marshal(self: &Arc<Self>, owner: ThreadId, handler: HandlerId, args: &A) {
        let instance = Arc::downgrade(self);
        let args = args.clone();

        self.queue.enqueue_channel_call(
            owner,
            self.id,
            Box::new(move || {
                if let Some(instance) = instance.upgrade() {
                    instance.invoke_marshaled(handler, &args);
                }
            }),
        );

        MARSHALED_CALLS.with(|event| event.observe_once());
    }

    fn invoke_marshaled(&self, handler: HandlerId, args: &A) {
        if self.is_destroyed() {
            return;
        }

        let callback = self
            .state
            .lock()
            .registry
            .get(handler)
            .map(|entry| Arc::clone(&entry.callback));

        match callback {
            Some(callback) => {
                callback(args);
                HANDLER_INVOCATIONS.with(|event| event.observe_once());
            }
            None => trace!(channel = %self.id, "marshaled call skipped, handler unsubscribed"),
        }
    }
}

impl<A> fmt::Debug for ChannelInstance<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("destroyed", &self.destroyed)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
