//! The process-wide asynchronous delivery service slot.

use parking_lot::RwLock;
use tracing::debug;

use crate::{AsyncEventQueue, Error, Result};

static INSTALLED: RwLock<Option<AsyncEventQueue>> = parking_lot::const_rwlock(None);

impl AsyncEventQueue {
    /// Makes `queue` the process-wide queue returned by [`instance()`][Self::instance].
    ///
    /// The application installs its queue once at startup, after which any component can
    /// reach it to create channels or pump it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceExists`] if a queue is already installed.
    pub fn install(queue: &Self) -> Result<()> {
        let mut installed = INSTALLED.write();

        if installed.is_some() {
            return Err(Error::InstanceExists);
        }

        *installed = Some(queue.clone());
        debug!(queue = queue.name(), "asynchronous event queue installed");

        Ok(())
    }

    /// The process-wide queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoInstance`] if no queue has been installed.
    pub fn instance() -> Result<Self> {
        INSTALLED.read().clone().ok_or(Error::NoInstance)
    }

    /// Removes the process-wide queue, returning it.
    ///
    /// The queue itself keeps working for anyone still holding it. Consider calling
    /// [`terminate()`][Self::terminate] on it when the process is shutting down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoInstance`] if no queue has been installed.
    pub fn uninstall() -> Result<Self> {
        let queue = INSTALLED.write().take().ok_or(Error::NoInstance)?;
        debug!(queue = queue.name(), "asynchronous event queue uninstalled");

        Ok(queue)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    // The slot is process-wide, so the whole lifecycle is one test to avoid other tests
    // racing on it.
    #[test]
    fn install_lifecycle() {
        assert!(matches!(AsyncEventQueue::instance(), Err(Error::NoInstance)));
        assert!(matches!(AsyncEventQueue::uninstall(), Err(Error::NoInstance)));

        let queue = AsyncEventQueue::builder().name("installed").build();
        AsyncEventQueue::install(&queue).unwrap();

        let other = AsyncEventQueue::new();
        assert!(matches!(
            AsyncEventQueue::install(&other),
            Err(Error::InstanceExists)
        ));

        assert_eq!(AsyncEventQueue::instance().unwrap().name(), "installed");

        let removed = AsyncEventQueue::uninstall().unwrap();
        assert_eq!(removed.name(), "installed");
        assert!(matches!(AsyncEventQueue::instance(), Err(Error::NoInstance)));

        AsyncEventQueue::install(&other).unwrap();
        AsyncEventQueue::uninstall().unwrap();
    }
}
