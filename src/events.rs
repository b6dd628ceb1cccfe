//! Bounded notification channel
//!
//! High-rate notifications (one per delivered frame) may be shed under
//! load; state and error notifications may not. Lossy sends stop short of
//! the last `EVENT_RESERVED_SLOTS` slots, and regular sends evict the
//! oldest pending event when the channel is full, so the newest state
//! always reaches the consumer.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fmt::Debug;

use crate::constants::{EVENT_CHANNEL_CAPACITY, EVENT_RESERVED_SLOTS};

/// Producer side of a notification channel
pub struct EventSink<T> {
    tx: Sender<T>,
    /// Kept for eviction; consumers get their own clone
    rx: Receiver<T>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Debug> EventSink<T> {
    pub fn new() -> Self {
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self { tx, rx }
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Deliver an event that must not be lost, evicting the oldest if full
    pub fn emit(&self, event: T) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    event = back;
                    if let Ok(evicted) = self.rx.try_recv() {
                        tracing::warn!("Event channel full, dropped {:?}", evicted);
                    }
                }
                // Unreachable while `self.rx` is alive.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Deliver an event that may be shed when the consumer falls behind
    ///
    /// Returns whether the event was queued.
    pub fn emit_lossy(&self, event: T) -> bool {
        if self.tx.len() + EVENT_RESERVED_SLOTS >= EVENT_CHANNEL_CAPACITY {
            tracing::trace!("Event channel busy, dropped {:?}", event);
            return false;
        }
        self.tx.try_send(event).is_ok()
    }
}

impl<T: Debug> Default for EventSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Note {
        Frame(usize),
        Closed,
    }

    #[test]
    fn test_lossy_events_leave_headroom() {
        let sink = EventSink::new();
        let rx = sink.receiver();

        let queued = (0..EVENT_CHANNEL_CAPACITY * 2)
            .filter(|i| sink.emit_lossy(Note::Frame(*i)))
            .count();
        assert_eq!(queued, EVENT_CHANNEL_CAPACITY - EVENT_RESERVED_SLOTS);

        sink.emit(Note::Closed);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), queued + 1);
        assert_eq!(events.last(), Some(&Note::Closed));
    }

    #[test]
    fn test_full_channel_keeps_newest_event() {
        let sink = EventSink::new();
        let rx = sink.receiver();

        for _ in 0..EVENT_CHANNEL_CAPACITY {
            sink.emit(Note::Frame(0));
        }
        sink.emit(Note::Closed);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY);
        assert_eq!(events.last(), Some(&Note::Closed));
    }
}
