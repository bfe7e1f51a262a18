//! Bounded queue between the capture thread and the link task.
//!
//! Push never blocks: when the queue is full the oldest blob is dropped so the
//! newest audio always goes out first once the link catches up.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::audio::PcmBlob;

/// Counters exposed so saturation is observable from outside the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboundStats {
    pub queued: usize,
    pub enqueued: u64,
    pub sent: u64,
    pub dropped_oldest: u64,
    pub send_failures: u64,
}

pub struct OutboundQueue {
    capacity: usize,
    queue: Mutex<VecDeque<PcmBlob>>,
    notify: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped_oldest: AtomicU64,
    send_failures: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped_oldest: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    /// Enqueue a blob. Returns `false` if an older blob had to be dropped.
    /// Blobs pushed after `close` are discarded.
    pub fn push(&self, blob: PcmBlob) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        let dropped = {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(blob);
            dropped
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        if dropped {
            let total = self.dropped_oldest.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 50 == 0 {
                log::warn!(
                    "Outbound audio queue saturated ({} frames), {} frame(s) dropped so far",
                    self.capacity,
                    total
                );
            }
        }
        !dropped
    }

    fn try_pop(&self) -> Option<PcmBlob> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    /// Wait for the next blob. Returns `None` once the queue is closed.
    ///
    /// Cancel safe: a blob is only removed when this returns it.
    pub async fn pop(&self) -> Option<PcmBlob> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(blob) = self.try_pop() {
                return Some(blob);
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting blobs, discard the backlog and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.notify.notify_one();
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            queued: self.queue.lock().unwrap_or_else(|p| p.into_inner()).len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use std::sync::Arc;
    use std::time::Duration;

    fn blob(value: f32) -> PcmBlob {
        codec::encode(&[value], 16000)
    }

    #[tokio::test]
    async fn keeps_fifo_order() {
        let queue = OutboundQueue::new(4);
        queue.push(blob(0.1));
        queue.push(blob(0.2));
        assert_eq!(queue.pop().await, Some(blob(0.1)));
        assert_eq!(queue.pop().await, Some(blob(0.2)));
    }

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push(blob(0.1)));
        assert!(queue.push(blob(0.2)));
        assert!(!queue.push(blob(0.3)));

        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dropped_oldest, 1);

        assert_eq!(queue.pop().await, Some(blob(0.2)));
        assert_eq!(queue.pop().await, Some(blob(0.3)));
    }

    #[tokio::test]
    async fn pop_wakes_on_push_from_another_thread() {
        let queue = Arc::new(OutboundQueue::new(2));
        let producer = queue.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(blob(0.5));
        });

        let got = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("pop never woke up");
        assert_eq!(got, Some(blob(0.5)));
    }

    #[tokio::test]
    async fn close_releases_waiter_and_backlog() {
        let queue = Arc::new(OutboundQueue::new(2));
        queue.push(blob(0.1));
        queue.close();
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.stats().queued, 0);

        // Pushing after close is a no-op.
        queue.push(blob(0.2));
        assert_eq!(queue.stats().queued, 0);
    }
}
