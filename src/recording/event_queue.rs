// src/recording/event_queue.rs
//! Lock-free bounded buffer of built records
//!
//! Producers push from any thread; the flush worker pops. A full buffer
//! rejects the record instead of blocking.

use crate::record::Record;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded MPMC record buffer
pub struct RecordQueue {
    queue: ArrayQueue<Record>,
    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl RecordQueue {
    /// Create a new queue holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push a record; returns the buffer length after the push.
    ///
    /// A full buffer hands the record back.
    pub fn push(&self, record: Record) -> Result<usize, Record> {
        match self.queue.push(record) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(self.queue.len())
            }
            Err(record) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(record)
            }
        }
    }

    pub fn try_pop(&self) -> Option<Record> {
        let record = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Pop up to `max` records in FIFO order
    pub fn pop_batch(&self, max: usize) -> Vec<Record> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.try_pop() {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Records accepted
    pub push_count: u64,

    /// Records handed to the flush worker
    pub pop_count: u64,

    /// Records rejected because the buffer was full
    pub drop_count: u64,

    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity.max(1) as f64) * 100.0
    }

    /// Rejected records as a percentage of all offered
    pub fn drop_rate(&self) -> f64 {
        let offered = self.push_count + self.drop_count;
        if offered == 0 {
            0.0
        } else {
            (self.drop_count as f64 / offered as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventType, PlayerRef, RecordBuilder};
    use std::sync::Arc;

    fn join(name: &str) -> Record {
        RecordBuilder::new(EventType::PlayerJoin)
            .player(PlayerRef::new(name, name))
            .build()
            .unwrap()
    }

    #[test]
    fn test_push_pop_is_fifo() {
        let queue = RecordQueue::new(10);
        assert_eq!(queue.push(join("a")).unwrap(), 1);
        assert_eq!(queue.push(join("b")).unwrap(), 2);

        let batch = queue.pop_batch(10);
        let names: Vec<_> = batch.iter().map(|r| r.player().unwrap().name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = RecordQueue::new(2);
        queue.push(join("a")).unwrap();
        queue.push(join("b")).unwrap();
        assert!(queue.is_full());

        let rejected = queue.push(join("c")).unwrap_err();
        assert_eq!(rejected.player().unwrap().name, "c");

        let stats = queue.stats();
        assert_eq!(stats.drop_count, 1);
        assert_eq!(stats.push_count, 2);
        assert!((stats.drop_rate() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.fill_percentage(), 100.0);
    }

    #[test]
    fn test_pop_batch_respects_max() {
        let queue = RecordQueue::new(10);
        for i in 0..7 {
            queue.push(join(&i.to_string())).unwrap();
        }
        assert_eq!(queue.pop_batch(5).len(), 5);
        assert_eq!(queue.pop_batch(5).len(), 2);
        assert_eq!(queue.stats().pop_count, 7);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(RecordQueue::new(1000));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        queue.push(join(&format!("{}-{}", i, j))).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.stats().drop_count, 0);
    }
}
