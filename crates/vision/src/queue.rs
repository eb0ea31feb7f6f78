use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

/// Bounded queue that evicts its oldest item instead of blocking when full.
///
/// Clones share the same buffer, so a producer and a consumer can each hold
/// one.
#[derive(Clone)]
pub struct DropOldestQueue<T> {
    name: &'static str,
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> DropOldestQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { name, tx, rx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert `item`, evicting from the front until it fits. Returns how many
    /// items were discarded.
    pub fn push(&self, item: T) -> usize {
        let mut item = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Both ends live in `self`.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        if evicted > 0 {
            metrics::counter!("vision_queue_dropped_total", "queue" => self.name)
                .increment(evicted as u64);
        }
        metrics::gauge!("vision_queue_depth", "queue" => self.name).set(self.rx.len() as f64);
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard everything currently buffered. Returns how many items were
    /// removed.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(0)
    }
}
