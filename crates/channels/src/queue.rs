//! Debounced inbound message queue.
//!
//! Messages enqueue into a bounded buffer (oldest dropped when full).
//! After `debounce_ms` of quiescence the queue drains in order through
//! the handler — a burst of messages produces one drain, not one wake-up
//! per message.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub struct MessageQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    buf: Mutex<VecDeque<T>>,
    max_size: usize,
    debounce: Duration,
    /// Wakes the drain task when a message arrives.
    arrived: Notify,
}

impl<T: Send + 'static> MessageQueue<T> {
    /// Create the queue and spawn its drain task. `handler` is invoked
    /// once per message, in enqueue order, after each quiescent window.
    pub fn new<F>(max_size: usize, debounce: Duration, mut handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let inner = Arc::new(QueueInner {
            buf: Mutex::new(VecDeque::new()),
            max_size,
            debounce,
            arrived: Notify::new(),
        });

        let drain = inner.clone();
        tokio::spawn(async move {
            loop {
                drain.arrived.notified().await;
                // Debounce: keep extending the window while messages
                // continue to arrive.
                loop {
                    let timeout = tokio::time::timeout(drain.debounce, drain.arrived.notified());
                    if timeout.await.is_err() {
                        break; // quiescent
                    }
                }
                loop {
                    let next = drain.buf.lock().pop_front();
                    match next {
                        Some(msg) => handler(msg),
                        None => break,
                    }
                }
            }
        });

        Self { inner }
    }

    /// Enqueue a message. Drops the oldest entry when full.
    pub fn enqueue(&self, msg: T) {
        {
            let mut buf = self.inner.buf.lock();
            if buf.len() >= self.inner.max_size {
                buf.pop_front();
                tracing::warn!("message queue full, dropping oldest");
            }
            buf.push_back(msg);
        }
        self.inner.arrived.notify_one();
    }

    /// Empty the queue without draining through the handler.
    pub fn clear(&self) {
        self.inner.buf.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buf.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collector() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(u32) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |msg: u32| sink.lock().push(msg))
    }

    #[tokio::test]
    async fn burst_drains_once_in_order() {
        let (seen, handler) = collector();
        let q = MessageQueue::new(100, Duration::from_millis(50), handler);

        for i in 0..5 {
            q.enqueue(i);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Nothing drained yet — gaps were under the debounce window.
        assert!(seen.lock().is_empty());

        // Quiescence: everything drains in order.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn handler_called_once_per_message() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let q = MessageQueue::new(100, Duration::from_millis(20), move |_: u32| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..7 {
            q.enqueue(i);
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (seen, handler) = collector();
        let q = MessageQueue::new(3, Duration::from_millis(20), handler);
        for i in 0..5 {
            q.enqueue(i);
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*seen.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn clear_discards_without_draining() {
        let (seen, handler) = collector();
        let q = MessageQueue::new(100, Duration::from_millis(30), handler);
        q.enqueue(1);
        q.enqueue(2);
        q.clear();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn messages_after_drain_start_new_window() {
        let (seen, handler) = collector();
        let q = MessageQueue::new(100, Duration::from_millis(30), handler);
        q.enqueue(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), vec![1]);

        q.enqueue(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), vec![1, 2]);
    }
}
