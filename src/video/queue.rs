//! Bounded drop-oldest frame queue
//!
//! A bounded crossbeam channel that never blocks or rejects the producer:
//! when full, the oldest pending item is evicted to admit the new one.
//! The channel doubles as the consumer's wake signal.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded multi-producer queue with drop-oldest backpressure
pub struct FrameQueue<T> {
    tx: Sender<T>,
    /// Kept by the queue for eviction; consumers get their own clone
    rx: Receiver<T>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, evicting the oldest ones if full
    ///
    /// Returns how many items were evicted to make room.
    pub fn push(&self, item: T) -> usize {
        let mut item = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    // A consumer may have freed a slot since the first attempt.
                    item = match self.tx.try_send(back) {
                        Ok(()) => return evicted,
                        Err(TrySendError::Full(back)) => back,
                        Err(TrySendError::Disconnected(_)) => return evicted,
                    };
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // Unreachable while `self.rx` is alive.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Non-blocking pop of the oldest item
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Receiver handle for a consumer thread
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Discard everything pending, returns the number discarded
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let queue = FrameQueue::new(5);
        for i in 0..7 {
            queue.push(i);
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_push_reports_evictions() {
        let queue = FrameQueue::new(1);
        assert_eq!(queue.push("a"), 0);
        assert_eq!(queue.push("b"), 1);
        assert_eq!(queue.pop(), Some("b"));
    }

    #[test]
    fn test_receiver_shares_items() {
        let queue = FrameQueue::new(3);
        let rx = queue.receiver();
        queue.push(10);
        assert_eq!(rx.try_recv(), Ok(10));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = FrameQueue::new(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_concurrent_consumer_accounts_for_every_item() {
        let queue = std::sync::Arc::new(FrameQueue::new(2));
        let rx = queue.receiver();
        let consumer = std::thread::spawn(move || {
            let mut received = 0usize;
            while rx.recv_timeout(std::time::Duration::from_millis(200)).is_ok() {
                received += 1;
            }
            received
        });

        let pushes = 10_000;
        let mut evicted = 0;
        for i in 0..pushes {
            evicted += queue.push(i);
        }
        let received = consumer.join().unwrap();

        assert_eq!(evicted as u64, queue.dropped());
        assert_eq!(received + evicted + queue.len(), pushes);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_capacity(capacity in 1usize..16, pushes in 0usize..64) {
            let queue = FrameQueue::new(capacity);
            for i in 0..pushes {
                queue.push(i);
                prop_assert!(queue.len() <= capacity);
            }
            prop_assert_eq!(queue.dropped() as usize, pushes.saturating_sub(capacity));
            prop_assert_eq!(queue.len(), pushes.min(capacity));
        }
    }
}
