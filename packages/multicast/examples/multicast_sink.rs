//! Tying the lifetime of subscriptions to the object that handles them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use multicast::{AsyncEventQueue, Event, Sink};

struct Document {
    saved: Event<String>,
    closed: Event<()>,
}

/// Counts document activity for as long as it lives.
struct StatusBar {
    saves: Arc<AtomicU32>,
    _subscriptions: Sink,
}

impl StatusBar {
    fn new(document: &Document) -> Self {
        let saves = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&saves);
        let mut subscriptions = Sink::from(document.saved.subscribe(move |path| {
            let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
            println!("status bar: saved {path} ({total} saves)");
        }));
        subscriptions += document
            .closed
            .subscribe(|()| println!("status bar: document closed"));

        Self {
            saves,
            _subscriptions: subscriptions,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = AsyncEventQueue::new();
    let document = Document {
        saved: Event::new(&queue),
        closed: Event::new(&queue),
    };

    let status_bar = StatusBar::new(&document);
    document.saved.trigger("draft.md".to_string());
    document.saved.trigger("final.md".to_string());
    println!("status bar counted {} saves", status_bar.saves.load(Ordering::Relaxed));

    // Dropping the status bar drops its sink, which unsubscribes its handlers.
    drop(status_bar);
    println!(
        "after the status bar is gone: {} save handlers, {} close handlers",
        document.saved.subscriber_count(),
        document.closed.subscriber_count()
    );

    document.closed.trigger(());
}
