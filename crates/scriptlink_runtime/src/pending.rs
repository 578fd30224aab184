//! Pending Binding Queue
//!
//! Holds subscriptions requested before the owning process is running and
//! the transport connected. Each deferred action receives the owner it was
//! queued on when it finally runs.

use std::collections::VecDeque;

/// A deferred action, run once against its owner
pub type PendingBinding<C> = Box<dyn FnOnce(&mut C) + Send>;

/// FIFO of deferred actions
pub struct PendingBindingQueue<C> {
    actions: VecDeque<PendingBinding<C>>,
}

impl<C> Default for PendingBindingQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PendingBindingQueue<C> {
    pub fn new() -> Self {
        Self {
            actions: VecDeque::new(),
        }
    }

    /// Append an action to the tail of the queue
    pub fn defer(&mut self, action: impl FnOnce(&mut C) + Send + 'static) {
        self.actions.push_back(Box::new(action));
    }

    /// Run every queued action in insertion order, then leave the queue empty.
    ///
    /// Returns the number of actions run. Flushing an empty queue does nothing.
    pub fn flush_once(&mut self, owner: &mut C) -> usize {
        let mut ran = 0;
        while let Some(action) = self.actions.pop_front() {
            action(owner);
            ran += 1;
        }
        ran
    }

    /// Drop every queued action without running it
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<C> std::fmt::Debug for PendingBindingQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBindingQueue")
            .field("len", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_runs_in_insertion_order() {
        let mut queue = PendingBindingQueue::<Vec<&'static str>>::new();
        queue.defer(|log| log.push("first"));
        queue.defer(|log| log.push("second"));
        queue.defer(|log| log.push("third"));

        let mut log = Vec::new();
        assert_eq!(queue.flush_once(&mut log), 3);
        assert_eq!(log, vec!["first", "second", "third"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_flush_is_noop() {
        let mut queue = PendingBindingQueue::<u32>::new();
        queue.defer(|n| *n += 1);

        let mut n = 0;
        queue.flush_once(&mut n);
        assert_eq!(queue.flush_once(&mut n), 0);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_clear_discards_without_running() {
        let mut queue = PendingBindingQueue::<u32>::new();
        queue.defer(|n| *n += 1);
        queue.defer(|n| *n += 1);
        queue.clear();

        let mut n = 0;
        assert_eq!(queue.flush_once(&mut n), 0);
        assert_eq!(n, 0);
    }
}
