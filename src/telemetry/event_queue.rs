// src/telemetry/event_queue.rs
//! Bounded lock-free telemetry buffer
//!
//! Recording never blocks: when the buffer is full the oldest event is
//! evicted to make room and counted as dropped.

use crate::telemetry::event::TelemetryEvent;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Drop-oldest FIFO of pending events
pub struct EventQueue {
    /// Underlying bounded queue
    queue: ArrayQueue<TelemetryEvent>,

    /// Push counter
    push_count: AtomicU64,

    /// Pop counter
    pop_count: AtomicU64,

    /// Events evicted by newer ones
    drop_count: AtomicU64,
}

impl EventQueue {
    /// Create a new event queue (`capacity` must be non-zero)
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push an event, returning the evicted oldest event if the queue was full
    pub fn push(&self, event: TelemetryEvent) -> Option<TelemetryEvent> {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(event);
        if evicted.is_some() {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Try to pop the oldest event (non-blocking)
    pub fn try_pop(&self) -> Option<TelemetryEvent> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
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

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Total events pushed
    pub push_count: u64,

    /// Total events popped
    pub pop_count: u64,

    /// Total events evicted (queue full)
    pub drop_count: u64,

    /// Current queue size
    pub current_size: usize,

    /// Queue capacity
    pub capacity: usize,
}

impl QueueStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}
