//! Synchronous typed publish/subscribe registry.
//!
//! Handlers run on the publishing thread, in subscription order, with
//! per-kind FIFO delivery. The bus buffers nothing beyond the call stack.
//! A panicking handler is caught and logged; later handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

use crate::events::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// In-process event bus shared by the pipeline, the keyboard controller and
/// the dashboard.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    shut_down: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Handlers registered after
    /// publishing has begun only see subsequent events.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut subscribers = self.subscribers.write().expect("event bus lock");
        subscribers.entry(kind).or_default().push(handler);
    }

    /// Register one handler for every event kind.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut subscribers = self.subscribers.write().expect("event bus lock");
        for kind in EventKind::ALL {
            subscribers.entry(*kind).or_default().push(handler.clone());
        }
    }

    /// Deliver an event to all handlers of its kind, in subscription order,
    /// on the calling thread.
    pub fn publish(&self, event: Event) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        // Snapshot the handler list so a handler that subscribes (or a
        // concurrent subscriber) cannot deadlock against the delivery loop.
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read().expect("event bus lock");
            match subscribers.get(&event.kind()) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for handler in handlers {
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                error!(kind = ?event.kind(), "Event handler panicked: {message}");
            }
        }
    }

    /// Stop all further delivery. Handlers registered remain but are never
    /// invoked again.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(EventKind::ActionMessage, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.publish(Event::ActionMessage {
            message: "ping".into(),
        });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn delivery_is_per_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        bus.subscribe(EventKind::RequestShutdown, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::RefreshRequested);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.publish(Event::RequestShutdown);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::ActionMessage, |_| {
            panic!("handler exploded");
        });
        let counted = hits.clone();
        bus.subscribe(EventKind::ActionMessage, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::ActionMessage {
            message: "still delivered".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_delivery_after_shutdown() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        bus.subscribe(EventKind::ActionMessage, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.shutdown();
        bus.publish(Event::ActionMessage {
            message: "dropped".into(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_all_sees_every_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        bus.subscribe_all(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::RequestShutdown);
        bus.publish(Event::RefreshRequested);
        bus.publish(Event::ProcessingFinished);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn subscription_during_publish_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let registered = Arc::new(AtomicUsize::new(0));

        let bus_inner = bus.clone();
        let registered_inner = registered.clone();
        bus.subscribe(EventKind::ActionMessage, move |_| {
            let count = registered_inner.clone();
            bus_inner.subscribe(EventKind::ActionMessage, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        });

        // First publish registers a new handler; only the second publish
        // reaches it (subsequent-notification only).
        bus.publish(Event::ActionMessage { message: "a".into() });
        assert_eq!(registered.load(Ordering::SeqCst), 0);
        bus.publish(Event::ActionMessage { message: "b".into() });
        assert_eq!(registered.load(Ordering::SeqCst), 1);
    }
}
