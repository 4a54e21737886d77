//! Blocking FIFO used by the outbound command queue.
//!
//! A `Notify`-guarded deque: `enqueue` pushes at the tail, `requeue`
//! reinserts at the head, and `dequeue` suspends until an item arrives.
//! Built for a single consumer (the delivery loop) and any number of
//! producers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug)]
pub struct Fifo<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Append an item at the tail. Never blocks; a waiting consumer is
    /// woken directly.
    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Reinsert an item at the head, ahead of everything not yet
    /// attempted. Never blocks.
    pub fn requeue(&self, item: T) {
        self.lock().push_front(item);
        self.available.notify_one();
    }

    /// Remove and return the head item, suspending until one is
    /// available.
    ///
    /// Cancel-safe: a caller that drops this future (for example inside
    /// `select!` with a cancellation token) leaves the queue contents
    /// untouched.
    pub async fn dequeue(&self) -> T {
        loop {
            if let Some(item) = self.lock().pop_front() {
                return item;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // No panics occur while the lock is held, but recover from a
        // poisoned lock anyway rather than unwinding the delivery loop.
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn preserves_insertion_order() {
        let fifo = Fifo::new();
        fifo.enqueue(1);
        fifo.enqueue(2);
        fifo.enqueue(3);

        assert_eq!(fifo.dequeue().await, 1);
        assert_eq!(fifo.dequeue().await, 2);
        assert_eq!(fifo.dequeue().await, 3);
        assert!(fifo.is_empty());
    }

    #[tokio::test]
    async fn requeue_places_item_ahead_of_pending_work() {
        let fifo = Fifo::new();
        fifo.enqueue("second");
        fifo.enqueue("third");
        fifo.requeue("first");

        assert_eq!(fifo.dequeue().await, "first");
        assert_eq!(fifo.dequeue().await, "second");
        assert_eq!(fifo.dequeue().await, "third");
    }

    #[tokio::test]
    async fn wakes_waiting_consumer_on_enqueue() {
        let fifo = Arc::new(Fifo::new());
        let consumer = {
            let fifo = Arc::clone(&fifo);
            tokio::spawn(async move { fifo.dequeue().await })
        };

        // Give the consumer a chance to park before producing.
        tokio::task::yield_now().await;
        fifo.enqueue(42);

        let received = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .expect("consumer task should not panic");
        assert_eq!(received, 42);
    }

    #[tokio::test]
    async fn pending_dequeue_can_be_abandoned_without_losing_items() {
        let fifo = Arc::new(Fifo::<u32>::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let fifo = Arc::clone(&fifo);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = fifo.dequeue() => Some(item),
                }
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on cancellation")
            .expect("waiter task should not panic");
        assert_eq!(outcome, None);

        // Items enqueued after the abandoned wait stay in the queue.
        fifo.enqueue(7);
        assert_eq!(fifo.len(), 1);
        assert_eq!(fifo.dequeue().await, 7);
    }
}
