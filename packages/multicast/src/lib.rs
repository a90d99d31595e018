#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Typed in-process publish/subscribe events.
//!
//! An [`Event<A>`] is a channel that delivers a value of type `A` to every handler subscribed
//! to it. It is the signal/slot core of an application: components publish what happened and
//! other components react without either knowing about the other.
//!
//! ```rust
//! use multicast::{AsyncEventQueue, Event, Sink};
//!
//! let queue = AsyncEventQueue::new();
//! let temperature = Event::<f64>::new(&queue);
//!
//! let sink = Sink::from(temperature.subscribe(|celsius| println!("it is {celsius} C")));
//!
//! temperature.trigger(21.5);
//!
//! // Dropping the sink unsubscribes the handler.
//! drop(sink);
//! assert_eq!(temperature.subscriber_count(), 0);
//! ```
//!
//! # Delivery
//!
//! Handlers run in subscription order. Any handler may [accept][Event::accept] the event to
//! stop delivery to the handlers after it. Handlers may subscribe, unsubscribe, trigger or
//! destroy the channel they are called from.
//!
//! Each channel is either synchronous, delivering inline from [`Event::trigger()`], or
//! asynchronous, in which case delivery happens when the application pumps the
//! [`AsyncEventQueue`] by calling [`AsyncEventQueue::exec()`]:
//!
//! ```rust
//! use multicast::{AsyncEventQueue, Event, TriggerType};
//!
//! let queue = AsyncEventQueue::new();
//! let saved = Event::<String>::new(&queue);
//! saved.set_trigger_type(TriggerType::Asynchronous);
//!
//! let _handle = saved.subscribe(|path| println!("saved {path}"));
//!
//! saved.trigger("notes.txt".to_string());
//!
//! // Nothing has been delivered yet. The main loop does that.
//! assert!(queue.exec());
//! ```
//!
//! # Threads
//!
//! Channels, handles and sinks may be shared between threads. Every handler is bound to the
//! thread that subscribed it: a trigger on another thread marshals the call to the subscribing
//! thread, which runs it during its next [`AsyncEventQueue::exec()`]. Handlers that may run
//! anywhere opt out with [`SubscriptionHandle::detach_affinity()`].
//!
//! # Lifetimes
//!
//! Subscriptions are not tied to the [`SubscriptionHandle`] returned when subscribing. A
//! handler stays registered until it is unsubscribed, until the last [`Sink`] holding it is
//! dropped, or until the channel is dropped. Handles and sinks may safely outlive the channel.
//!
//! # Observability
//!
//! The crate emits `tracing` events at trace and debug level and records delivery metrics via
//! the `nm` crate (`multicast_*` events).

mod async_queue;
mod destroyed_flag;
mod error;
mod event;
mod global;
mod handle;
mod identity;
mod instance;
mod metrics;
mod registry;
mod sink;
#[cfg(test)]
mod test_utils;
mod trigger_type;

pub use async_queue::*;
pub use destroyed_flag::*;
pub use error::*;
pub use event::*;
pub use handle::*;
pub(crate) use identity::HandlerId;
pub use identity::{ChannelId, DedupKey};
pub use sink::*;
pub use trigger_type::*;
