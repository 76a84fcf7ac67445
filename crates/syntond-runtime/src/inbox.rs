//! Bounded lock-free inbox with backpressure.

use crossbeam_queue::ArrayQueue;

/// A bounded MPSC queue carrying messages into a worker thread.
///
/// When the inbox is full, `send` hands the message back to the caller so
/// it can decide whether to drop, retry or fail — no producer ever blocks
/// on a slow worker.
#[derive(Debug)]
pub struct Inbox<T> {
    inner: ArrayQueue<T>,
}

impl<T> Inbox<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "inbox capacity must be positive");
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Enqueues a message, or returns it when the inbox is full.
    pub fn send(&self, msg: T) -> Result<(), T> {
        self.inner.push(msg)
    }

    /// Dequeues the oldest message, if any.
    pub fn try_recv(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let inbox = Inbox::new(4);
        inbox.send(1).unwrap();
        inbox.send(2).unwrap();
        inbox.send(3).unwrap();

        assert_eq!(inbox.try_recv(), Some(1));
        assert_eq!(inbox.try_recv(), Some(2));
        assert_eq!(inbox.try_recv(), Some(3));
        assert_eq!(inbox.try_recv(), None);
    }

    #[test]
    fn full_inbox_returns_message() {
        let inbox = Inbox::new(2);
        inbox.send("a").unwrap();
        inbox.send("b").unwrap();
        assert_eq!(inbox.send("c"), Err("c"));

        inbox.try_recv();
        assert_eq!(inbox.send("c"), Ok(()));
    }

    #[test]
    #[should_panic(expected = "inbox capacity must be positive")]
    fn zero_capacity_panics() {
        let _: Inbox<()> = Inbox::new(0);
    }
}
