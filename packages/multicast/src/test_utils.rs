//! Testing utilities shared by the test modules of this crate.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a test on a separate thread and panics if it does not finish within 10 seconds.
///
/// Used by tests that coordinate several threads, where a delivery bug shows up as a hang.
pub(crate) fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // The receiver is gone if we already timed out.
        drop(tx.send(result));
    });

    match rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {WATCHDOG_TIMEOUT:?} - a delivery is likely stuck");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}
