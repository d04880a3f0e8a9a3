//! Bounded row queues between stage copies.
//!
//! Every hop instance in the bound topology is one [`RowQueue`] with exactly
//! one producer endpoint and one consumer endpoint. The queue is the only
//! state shared between two workers; each operation takes the buffer lock
//! for its own duration and nothing holds it across a suspension.

use crate::row::Row;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies one concrete stage copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// The stage name.
    pub stage: String,
    /// The copy index within the stage.
    pub copy: usize,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(stage: impl Into<String>, copy: usize) -> Self {
        Self {
            stage: stage.into(),
            copy,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.copy)
    }
}

/// A capacity-limited FIFO of rows between one producer and one consumer.
///
/// `mark_done` is idempotent and the only transition that may race with the
/// other endpoint's pushes and pops: after it, pushes are rejected but
/// buffered rows keep draining. A consumer seeing empty-and-done treats the
/// queue as permanently exhausted.
#[derive(Debug)]
pub struct RowQueue {
    buffer: Mutex<VecDeque<Row>>,
    capacity: usize,
    done: AtomicBool,
}

impl RowQueue {
    /// Creates a queue with a fixed capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            done: AtomicBool::new(false),
        }
    }

    /// Attempts to enqueue a row.
    ///
    /// Hands the row back when the queue is at capacity or marked done;
    /// never blocks, never overwrites.
    pub fn try_push(&self, row: Row) -> Result<(), Row> {
        if self.is_done() {
            return Err(row);
        }
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            return Err(row);
        }
        buffer.push_back(row);
        Ok(())
    }

    /// Dequeues the oldest row, if any.
    pub fn pop(&self) -> Option<Row> {
        self.buffer.lock().pop_front()
    }

    /// Returns the number of buffered rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Returns true if no rows are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Returns true if the buffer is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Returns the fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marks the producing side as finished. Idempotent.
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Returns true once the producing side has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// One edge instance of the bound topology.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// The producing stage copy.
    pub origin: Endpoint,
    /// The consuming stage copy.
    pub destination: Endpoint,
    /// The queue carrying the rows.
    pub queue: Arc<RowQueue>,
}

impl QueueBinding {
    /// Creates a binding.
    #[must_use]
    pub fn new(origin: Endpoint, destination: Endpoint, queue: Arc<RowQueue>) -> Self {
        Self {
            origin,
            destination,
            queue,
        }
    }
}

impl fmt::Display for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.origin, self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowBuilder;

    fn row(id: i64) -> Row {
        RowBuilder::new().field("id", id).build()
    }

    #[test]
    fn test_fifo_order() {
        let q = RowQueue::new(10);
        for i in 0..5 {
            assert!(q.try_push(row(i)).is_ok());
        }
        for i in 0..5 {
            let popped = q.pop().unwrap();
            assert_eq!(popped.get("id").unwrap().as_integer(), Some(i));
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_capacity_rejects_push() {
        let q = RowQueue::new(2);
        assert!(q.try_push(row(1)).is_ok());
        assert!(q.try_push(row(2)).is_ok());
        assert!(q.is_full());

        let bounced = q.try_push(row(3)).unwrap_err();
        assert_eq!(q.len(), 2);

        q.pop();
        assert!(!q.is_full());
        assert!(q.try_push(bounced).is_ok());
    }

    #[test]
    fn test_done_drains_then_exhausts() {
        let q = RowQueue::new(10);
        assert!(q.try_push(row(1)).is_ok());
        assert!(q.try_push(row(2)).is_ok());
        q.mark_done();
        q.mark_done(); // idempotent

        assert!(q.try_push(row(3)).is_err());
        assert!(q.pop().is_some());
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
        assert!(q.is_empty() && q.is_done());
    }

    #[test]
    fn test_endpoint_display() {
        let binding = QueueBinding::new(
            Endpoint::new("read", 0),
            Endpoint::new("filter", 2),
            Arc::new(RowQueue::new(1)),
        );
        assert_eq!(binding.to_string(), "read.0 -> filter.2");
    }

    #[test]
    fn test_concurrent_push_pop() {
        let q = Arc::new(RowQueue::new(16));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut pushed = 0;
                while pushed < 1000 {
                    if q.try_push(row(pushed)).is_ok() {
                        pushed += 1;
                    }
                }
                q.mark_done();
            })
        };

        let mut seen = 0i64;
        loop {
            if let Some(r) = q.pop() {
                assert_eq!(r.get("id").unwrap().as_integer(), Some(seen));
                seen += 1;
            } else if q.is_done() && q.is_empty() {
                break;
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, 1000);
    }
}
