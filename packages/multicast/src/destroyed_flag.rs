use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag that becomes set when the channel it was sourced from is destroyed.
///
/// Every deferred delivery carries a clone of its channel's flag and checks it immediately
/// before running, so nothing queued for a channel runs after that channel is gone.
#[derive(Clone, Debug, Default)]
pub struct DestroyedFlag {
    destroyed: Arc<AtomicBool>,
}

impl DestroyedFlag {
    /// Creates a flag in the "alive" state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the owner of the flag has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        // Acquire pairs with the Release in `set()` so whoever observes the flag also
        // observes everything the owner did before destroying itself.
        self.destroyed.load(Ordering::Acquire)
    }

    /// Marks the owner as destroyed. Visible to every clone of this flag.
    pub fn set(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}
