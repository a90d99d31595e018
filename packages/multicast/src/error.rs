use thiserror::Error;

use crate::ChannelId;

/// Errors reported by the low-level [`AsyncEventQueue`][crate::AsyncEventQueue] API.
///
/// The public surface of [`Event`][crate::Event] never returns these. They only surface when
/// code drives the asynchronous delivery service directly.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The process-wide asynchronous delivery service was requested before one was installed.
    #[error("no asynchronous event queue has been installed for this process")]
    NoInstance,

    /// A process-wide asynchronous delivery service was installed while another one was
    /// already installed.
    #[error("an asynchronous event queue is already installed for this process")]
    InstanceExists,

    /// The queue holds no pending deliveries for the referenced channel.
    #[error("no pending deliveries are queued for channel {channel}")]
    EventNotFound {
        /// The channel the caller referenced.
        channel: ChannelId,
    },
}

/// A specialized `Result` type for asynchronous delivery operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn event_not_found_names_channel() {
        let channel = ChannelId::next();
        let error = Error::EventNotFound { channel };

        assert!(error.to_string().contains(&channel.to_string()));
    }
}
