//! A main loop that pumps the process-wide queue while worker threads publish progress.
//!
//! Handlers subscribed on the main thread always run on the main thread, no matter which
//! thread triggers the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use multicast::{AsyncEventQueue, Event, TriggerType};

const WORKERS: u32 = 3;

fn main() -> multicast::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = AsyncEventQueue::builder().name("main_loop").build();
    AsyncEventQueue::install(&queue)?;

    let progress = Arc::new(Event::<(u32, u32)>::new(&AsyncEventQueue::instance()?));
    let finished = Arc::new(Event::<u32>::new(&AsyncEventQueue::instance()?));
    finished.set_trigger_type(TriggerType::Asynchronous);

    let main_thread = thread::current().id();

    let _progress = progress.subscribe(move |(worker, percent)| {
        assert_eq!(thread::current().id(), main_thread);
        println!("worker {worker} is at {percent}%");
    });

    let done = Arc::new(AtomicU32::new(0));
    let done_counter = Arc::clone(&done);
    let _finished = finished.subscribe(move |worker| {
        done_counter.fetch_add(1, Ordering::Relaxed);
        println!("worker {worker} finished");
    });

    let workers = (0..WORKERS)
        .map(|worker| {
            let progress = Arc::clone(&progress);
            let finished = Arc::clone(&finished);

            thread::spawn(move || {
                for percent in [25, 50, 75, 100] {
                    progress.trigger((worker, percent));
                    thread::sleep(Duration::from_millis(5));
                }

                finished.trigger(worker);
            })
        })
        .collect::<Vec<_>>();

    while done.load(Ordering::Relaxed) < WORKERS {
        if !queue.exec() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    for worker in workers {
        worker.join().expect("worker thread panicked");
    }

    // Progress reports marshaled after the last completion notice.
    queue.exec();

    // Anything still queued is dropped without running.
    AsyncEventQueue::uninstall()?.terminate();

    Ok(())
}
