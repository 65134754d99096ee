//! Fixed-capacity queue that overwrites its oldest entry when full.
//!
//! Recording is best effort: when the disk falls behind, old packets are
//! discarded so that `push` never waits and the relay keeps forwarding.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Multi-producer, single-consumer ring buffer with drop-oldest overflow
pub struct DropOldestQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking. Returns `true` if an older item was evicted
    /// to make room. Items pushed after `close` are discarded.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items; the consumer still drains what is queued
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DropOldestQueue::new(4);
        for i in 0..3 {
            assert!(!queue.push(i));
        }
        assert_eq!(queue.pop().await, Some(0));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let queue = DropOldestQueue::new(3);
        for i in 0..3 {
            queue.push(i);
        }
        assert!(queue.push(3));
        assert!(queue.push(4));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, Some(4));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = DropOldestQueue::new(8);
        queue.push("a");
        queue.close();
        assert!(!queue.push("b"));

        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(DropOldestQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(42);

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(item, Some(42));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue: Arc<DropOldestQueue<u8>> = Arc::new(DropOldestQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(item, None);
    }
}
