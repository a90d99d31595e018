//! Ordered storage of the handlers registered with one channel.

use std::collections::BTreeMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::ThreadId;

use foldhash::HashMap;

use crate::{DedupKey, HandlerId};

/// A subscriber callback as stored in the registry.
///
/// Kept behind an `Arc` so dispatch can take a copy and release the channel lock before
/// invoking it.
pub(crate) type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// One registered handler.
pub(crate) struct HandlerEntry<A> {
    /// The thread the handler must be invoked on. `None` means any thread.
    pub(crate) affinity: Option<ThreadId>,

    pub(crate) key: Option<DedupKey>,

    pub(crate) callback: Callback<A>,

    /// Number of sink references currently keeping this entry registered.
    pub(crate) sink_refs: u32,
}

impl<A> fmt::Debug for HandlerEntry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("affinity", &self.affinity)
            .field("key", &self.key)
            .field("sink_refs", &self.sink_refs)
            .finish_non_exhaustive()
    }
}

/// Handlers of one channel, in registration order.
///
/// Every handler is addressed by a [`HandlerId`] that stays valid until that handler is
/// removed. Removing a handler never affects the identity or relative order of any other.
pub(crate) struct HandlerRegistry<A> {
    // Identifiers are allocated in increasing order, so map order is registration order.
    entries: BTreeMap<HandlerId, HandlerEntry<A>>,

    by_key: HashMap<DedupKey, HandlerId>,

    next_id: HandlerId,
}

impl<A> HandlerRegistry<A> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_key: HashMap::default(),
            next_id: HandlerId::FIRST,
        }
    }

    /// Registers `callback`, or replaces the callback of the handler already registered
    /// under `key`. A replaced handler keeps its identity, position, affinity and
    /// reference count.
    ///
    /// Returns the replaced callback, if any, so the caller can drop it outside its lock.
    pub(crate) fn insert(
        &mut self,
        callback: Callback<A>,
        key: Option<DedupKey>,
        affinity: Option<ThreadId>,
    ) -> (HandlerId, Option<Callback<A>>) {
        let Some(key) = key else {
            return (self.push(callback, affinity), None);
        };

        match self.by_key.entry(key) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let entry = self
                    .entries
                    .get_mut(&id)
                    .expect("dedup key index refers to a handler that is not registered");

                (id, Some(mem::replace(&mut entry.callback, callback)))
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id;
                self.next_id = id.successor();

                vacant.insert(id);
                self.entries.insert(
                    id,
                    HandlerEntry {
                        affinity,
                        key: Some(key),
                        callback,
                        sink_refs: 0,
                    },
                );

                (id, None)
            }
        }
    }

    fn push(&mut self, callback: Callback<A>, affinity: Option<ThreadId>) -> HandlerId {
        let id = self.next_id;
        self.next_id = id.successor();

        self.entries.insert(
            id,
            HandlerEntry {
                affinity,
                key: None,
                callback,
                sink_refs: 0,
            },
        );

        id
    }

    /// Removes the handler, returning it if it was registered.
    pub(crate) fn remove(&mut self, id: HandlerId) -> Option<HandlerEntry<A>> {
        let entry = self.entries.remove(&id)?;

        if let Some(key) = entry.key {
            // Only drop the index entry if it still points at us.
            if self.by_key.get(&key) == Some(&id) {
                self.by_key.remove(&key);
            }
        }

        Some(entry)
    }

    pub(crate) fn id_for_key(&self, key: DedupKey) -> Option<HandlerId> {
        self.by_key.get(&key).copied()
    }

    pub(crate) fn get(&self, id: HandlerId) -> Option<&HandlerEntry<A>> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: HandlerId) -> Option<&mut HandlerEntry<A>> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: HandlerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Identifiers of all registered handlers, in delivery order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = HandlerId> + '_ {
        self.entries.keys().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<A> fmt::Debug for HandlerRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entries", &self.entries)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
