//! Synchronous listener lists
//!
//! Used for both setting-change notifications and client events. Listeners
//! run on the caller's thread, in registration order, before the notifying
//! call returns.

use std::fmt;
use tokio::sync::mpsc;

/// Handle returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Returns `false` once the listener can no longer receive values
type Listener<T> = Box<dyn FnMut(&T) -> bool>;

/// Ordered list of callbacks invoked with every emitted value
pub struct Listeners<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Listener<T>)>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Register a listener
    pub fn add<F>(&mut self, mut listener: F) -> ListenerId
    where
        F: FnMut(&T) + 'static,
    {
        self.push(Box::new(move |value: &T| {
            listener(value);
            true
        }))
    }

    fn push(&mut self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Unregister a listener, returns whether it was registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Invoke every listener with `value`, dropping the ones that went away
    pub fn emit(&mut self, value: &T) {
        self.entries.retain_mut(|(_, listener)| listener(value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone + 'static> Listeners<T> {
    /// Forward every emitted value into an unbounded channel.
    ///
    /// The listener is unregistered by the first emit after the receiver is
    /// dropped.
    pub fn channel(&mut self) -> (ListenerId, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.push(Box::new(move |value: &T| tx.send(value.clone()).is_ok()));
        (id, rx)
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_emit_reaches_listeners_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut listeners = Listeners::new();

        let first = seen.clone();
        listeners.add(move |v: &i32| first.borrow_mut().push(("first", *v)));
        let second = seen.clone();
        listeners.add(move |v: &i32| second.borrow_mut().push(("second", *v)));

        listeners.emit(&5);
        assert_eq!(*seen.borrow(), vec![("first", 5), ("second", 5)]);
    }

    #[test]
    fn test_remove_listener() {
        let count = Rc::new(RefCell::new(0));
        let mut listeners = Listeners::new();

        let counter = count.clone();
        let id = listeners.add(move |_: &()| *counter.borrow_mut() += 1);
        listeners.emit(&());
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&());

        assert_eq!(*count.borrow(), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_channel_forwarding() {
        let mut listeners = Listeners::new();
        let (_, mut rx) = listeners.channel();

        listeners.emit(&"hello".to_string());
        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert!(rx.try_recv().is_err());

        drop(rx);
        listeners.emit(&"dropped".to_string());
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_dropped_channels_do_not_accumulate() {
        let mut listeners = Listeners::new();
        let (_, mut kept) = listeners.channel();
        for round in 0..10 {
            let (_, rx) = listeners.channel();
            drop(rx);
            listeners.emit(&round);
        }

        assert_eq!(listeners.len(), 1);
        let received: Vec<i32> = std::iter::from_fn(|| kept.try_recv().ok()).collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }
}
