//! Bounded drop-oldest queue
//!
//! One structure serves three roles: the frame distribution queue (latest
//! wins), the raw BLE notification queue (a callback must never block), and
//! the command queue (bounded, rejecting when full). Consumers can wait from
//! a plain thread or from an async task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Counters for queue monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// Fixed-capacity FIFO with atomic evict-then-insert
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    notify: Notify,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    fn wake(&self) {
        self.available.notify_one();
        self.notify.notify_one();
    }

    /// Insert `item`, evicting the oldest entry if full
    ///
    /// Returns whatever was discarded: the evicted entry, or `item` itself
    /// when the queue is closed.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(item);
            }
            let evicted = if inner.items.len() >= inner.capacity {
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(item);
            evicted
        };

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.wake();
        evicted
    }

    /// Insert `item` only if there is room
    pub fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.items.len() >= inner.capacity {
                return Err(item);
            }
            inner.items.push_back(item);
        }
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.wake();
        Ok(())
    }

    /// Take the oldest item without waiting
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Take the oldest item, blocking the thread up to `timeout`
    ///
    /// `None` means nothing arrived in time (or the queue was closed while
    /// empty); it is not an error.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return inner.items.pop_front();
            }
        }
    }

    /// Take the oldest item, suspending the task up to `timeout`
    pub async fn pop_timeout_async(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    /// Wait until at least one item is queued, without consuming it
    pub async fn wait_nonempty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock();
                if !inner.items.is_empty() {
                    return true;
                }
                if inner.closed {
                    return false;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_empty();
            }
        }
    }

    /// Discard every queued item, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        n
    }

    /// Refuse further pushes and wake all waiters
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    /// Accept pushes again after [`close`](Self::close)
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Change the capacity, evicting the oldest items if now over it
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        let excess = inner.items.len().saturating_sub(capacity);
        if excess > 0 {
            inner.items.drain(..excess);
            self.total_dropped.fetch_add(excess as u64, Ordering::Relaxed);
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock();
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: inner.items.len(),
            capacity: inner.capacity,
        }
    }

    /// Reset counters (on session restart)
    pub fn reset_metrics(&self) {
        self.total_pushed.store(0, Ordering::Relaxed);
        self.total_dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overflow_keeps_most_recent() {
        let q = BoundedQueue::new(3);
        for i in 0..4 {
            q.push(i);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert_eq!(q.metrics().total_dropped, 1);
    }

    #[test]
    fn test_push_returns_evicted() {
        let q = BoundedQueue::new(1);
        assert_eq!(q.push('a'), None);
        assert_eq!(q.push('b'), Some('a'));
    }

    #[test]
    fn test_try_push_rejects_when_full() {
        let q = BoundedQueue::new(2);
        assert!(q.try_push(1).is_ok());
        assert!(q.try_push(2).is_ok());
        assert_eq!(q.try_push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn test_pop_timeout_empty() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1);
        let start = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_timeout_woken_by_push() {
        let q = Arc::new(BoundedQueue::new(4));
        let producer = Arc::clone(&q);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_refuses_and_wakes() {
        let q = Arc::new(BoundedQueue::<u8>::new(4));
        let waiter = Arc::clone(&q);
        let handle = std::thread::spawn(move || waiter.pop_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
        assert_eq!(q.push(1), Some(1));
        assert!(q.try_push(1).is_err());

        q.reopen();
        assert_eq!(q.push(1), None);
    }

    #[test]
    fn test_set_capacity_truncates_oldest() {
        let q = BoundedQueue::new(10);
        for i in 0..10 {
            q.push(i);
        }
        q.set_capacity(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn test_clear() {
        let q = BoundedQueue::new(5);
        q.push(1);
        q.push(2);
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_async_pop_woken_by_thread() {
        let q = Arc::new(BoundedQueue::new(4));
        let producer = Arc::clone(&q);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push("frame");
        });
        assert_eq!(q.pop_timeout_async(Duration::from_secs(5)).await, Some("frame"));
    }

    #[tokio::test]
    async fn test_async_pop_times_out() {
        let q: BoundedQueue<u8> = BoundedQueue::new(4);
        assert_eq!(q.pop_timeout_async(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn test_wait_nonempty_does_not_consume() {
        let q = Arc::new(BoundedQueue::new(4));
        assert!(!q.wait_nonempty(Duration::from_millis(10)).await);

        let producer = Arc::clone(&q);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(7u8);
        });
        assert!(q.wait_nonempty(Duration::from_secs(5)).await);
        assert_eq!(q.len(), 1);
    }
}
