//! Observer Signals
//!
//! A [`Signal`] is a one-to-many observer list. Handlers run synchronously,
//! in subscription order, on whichever context calls [`Signal::emit`].

/// Handle returned by [`Signal::subscribe`], used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Handler<T> = Box<dyn FnMut(&T) + Send>;

/// Multicast observer list
pub struct Signal<T> {
    handlers: Vec<(SubscriptionHandle, Handler<T>)>,
    next_handle: u64,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    /// Create an empty signal
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            next_handle: 1,
        }
    }

    /// Register a handler
    pub fn subscribe(&mut self, handler: impl FnMut(&T) + Send + 'static) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;
        self.handlers.push((handle, Box::new(handler)));
        handle
    }

    /// Remove a handler. Returns false if the handle was unknown.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != handle);
        self.handlers.len() != before
    }

    /// Invoke every handler with `value`
    pub fn emit(&mut self, value: &T) {
        for (_, handler) in self.handlers.iter_mut() {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_emit_reaches_every_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut signal = Signal::<i32>::new();

        let a = Arc::clone(&seen);
        signal.subscribe(move |v| a.lock().unwrap().push(("a", *v)));
        let b = Arc::clone(&seen);
        signal.subscribe(move |v| b.lock().unwrap().push(("b", *v)));

        signal.emit(&5);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 5), ("b", 5)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let count = Arc::new(Mutex::new(0));
        let mut signal = Signal::<()>::new();

        let c = Arc::clone(&count);
        let handle = signal.subscribe(move |_| *c.lock().unwrap() += 1);
        signal.emit(&());
        assert!(signal.unsubscribe(handle));
        assert!(!signal.unsubscribe(handle));
        signal.emit(&());

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(signal.is_empty());
    }
}
