/// How [`Event::trigger()`][crate::Event::trigger] delivers to handlers.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum TriggerType {
    /// Behaves as [`TriggerType::Synchronous`].
    #[default]
    Default,

    /// Handlers are invoked inline, on the call stack of the trigger.
    Synchronous,

    /// Delivery is deferred to the next pump cycle of the channel's
    /// [`AsyncEventQueue`][crate::AsyncEventQueue].
    Asynchronous,
}

impl TriggerType {
    /// Whether a trigger in this mode is deferred to the asynchronous queue.
    #[must_use]
    pub fn is_deferred(self) -> bool {
        matches!(self, Self::Asynchronous)
    }
}
