//! Subscribing to a channel, consuming events and replacing handlers by key.

use std::sync::Arc;

use multicast::{AsyncEventQueue, DedupKey, Event};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let queue = AsyncEventQueue::new();
    let key_pressed = Arc::new(Event::<char>::new(&queue));

    let _logger = key_pressed.subscribe(|key| println!("logger saw {key:?}"));

    // Escape never reaches the handlers subscribed after this one.
    let weak = Arc::downgrade(&key_pressed);
    let _escape_filter = key_pressed.subscribe(move |key| {
        if *key == '\u{1b}' {
            println!("filter consumed escape");

            if let Some(event) = weak.upgrade() {
                event.accept();
            }
        }
    });

    let _editor = key_pressed.subscribe(|key| println!("editor inserts {key:?}"));

    println!("'a' delivered to everyone: {}", key_pressed.trigger('a'));
    println!("escape delivered to everyone: {}", key_pressed.trigger('\u{1b}'));

    // Subscribing under the same key replaces the handler instead of adding another one.
    let mode = DedupKey::new(1);
    key_pressed.subscribe_keyed(mode, |_| println!("insert mode"));
    key_pressed.subscribe_keyed(mode, |_| println!("overwrite mode"));

    println!("{} handlers subscribed", key_pressed.subscriber_count());
    key_pressed.trigger('b');

    key_pressed.unsubscribe(mode);
    println!("{} handlers subscribed", key_pressed.subscriber_count());
}
