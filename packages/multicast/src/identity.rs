use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one materialized channel instance for the lifetime of the process.
///
/// Identifiers are never reused, so an identifier held by a queued delivery can never be
/// confused with a channel created after the original one was destroyed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        // Relaxed is enough, we only need uniqueness, not ordering with other memory.
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a subscribing context, used to deduplicate subscriptions.
///
/// Subscribing twice with the same key replaces the callback of the existing subscription
/// instead of adding a second one.
///
/// # Example
///
/// ```rust
/// use multicast::DedupKey;
///
/// struct Widget;
///
/// let widget = Widget;
/// assert_eq!(DedupKey::of(&widget), DedupKey::of(&widget));
/// assert_ne!(DedupKey::new(1), DedupKey::new(2));
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DedupKey(usize);

impl DedupKey {
    /// Creates a key from an arbitrary caller-chosen value.
    #[must_use]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Creates a key from the address of `owner`.
    ///
    /// The key is only meaningful while `owner` stays at the same address.
    #[must_use]
    pub fn of<T: ?Sized>(owner: &T) -> Self {
        Self(ptr::from_ref(owner).cast::<()>().addr())
    }
}

/// Stable identity of one registered handler within its channel.
///
/// Identifiers grow monotonically, so ordering by identifier is ordering by registration.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HandlerId(u64);

impl HandlerId {
    pub(crate) const FIRST: Self = Self(0);

    pub(crate) fn successor(self) -> Self {
        Self(
            self.0
                .checked_add(1)
                .expect("handler identifier space exhausted - cannot register more handlers"),
        )
    }
}
