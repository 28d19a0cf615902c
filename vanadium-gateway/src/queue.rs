//! Offline send queue.
//!
//! Senders that find the socket closed park here and are released, in queue
//! order, when a reconnect completes with Ready or Resumed. High-priority
//! senders park at the head. Waiters survive failed reconnect attempts; only
//! a drain or shutdown releases them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Inner {
    waiting: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

/// Deque of senders parked while the socket is down.
#[derive(Debug, Default)]
pub(crate) struct OfflineQueue {
    inner: Mutex<Inner>,
}

impl OfflineQueue {
    /// Park the caller. The returned receiver completes on the next drain,
    /// or fails immediately when the queue is closed.
    pub fn park(&self, high_priority: bool) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            if high_priority {
                inner.waiting.push_front(tx);
            } else {
                inner.waiting.push_back(tx);
            }
        }
        rx
    }

    /// Release every parked sender in queue order.
    pub fn drain(&self) {
        let drained: Vec<_> = self.inner.lock().waiting.drain(..).collect();
        for tx in drained {
            let _ = tx.send(());
        }
    }

    /// Drop every parked sender and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiting.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_queue_order_with_priority_at_head() {
        let queue = OfflineQueue::default();

        let low_a = queue.park(false);
        let low_b = queue.park(false);
        let high = queue.park(true);
        assert_eq!(queue.len(), 3);

        queue.drain();
        assert_eq!(queue.len(), 0);

        // All released; the high-priority waiter sat at the head.
        high.await.unwrap();
        low_a.await.unwrap();
        low_b.await.unwrap();
    }

    #[tokio::test]
    async fn drain_releases_each_waiter_once() {
        let queue = OfflineQueue::default();
        let rx = queue.park(false);
        queue.drain();
        rx.await.unwrap();

        // A second drain has nothing to release.
        queue.drain();
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn close_cancels_parked_and_future_waiters() {
        let queue = OfflineQueue::default();
        let parked = queue.park(false);
        queue.close();

        assert!(parked.await.is_err());
        assert!(queue.park(false).await.is_err());
    }
}
