// src/runtime/admission.rs
//! Process-wide admission control for sandbox instances
//!
//! Bounds the number of concurrently Ready/Busy sandboxes on this host.
//! Acquiring a slot is the only point where battles block on each other.
//!
//! # Architecture
//!
//! ```text
//! AdmissionPool (capacity N)
//! ├─ Semaphore: N permits       (waiters queue FIFO, bounded wait)
//! └─ in_use: AtomicUsize        (never exceeds N)
//! ```

use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Bounded pool of sandbox slots
#[derive(Debug)]
pub struct AdmissionPool {
    /// Maximum concurrent sandboxes
    capacity: usize,

    /// Semaphore to limit concurrent acquisitions
    semaphore: Arc<Semaphore>,

    /// Slots currently held
    in_use: Arc<AtomicUsize>,
}

/// A held slot; released when dropped
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "admission counter underflow");
        metrics::gauge!("battle_sandbox_slots_in_use").decrement(1.0);
    }
}

impl AdmissionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait up to `wait` for a free slot
    pub async fn acquire(&self, wait: Duration) -> Result<AdmissionPermit> {
        let exhausted = || EngineError::ResourceExhausted {
            waited_ms: wait.as_millis() as u64,
        };

        let permit = match tokio::time::timeout(wait, Arc::clone(&self.semaphore).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                warn!("Admission pool closed while waiting for a slot");
                return Err(exhausted());
            }
            Err(_elapsed) => {
                warn!(capacity = self.capacity, "Timed out waiting for a sandbox slot");
                return Err(exhausted());
            }
        };

        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let previous = self.in_use.fetch_add(1, Ordering::AcqRel);
        debug_assert!(
            previous < self.capacity,
            "admission counter exceeded capacity {}",
            self.capacity
        );
        metrics::gauge!("battle_sandbox_slots_in_use").increment(1.0);
        debug!(in_use = previous + 1, capacity = self.capacity, "Sandbox slot acquired");

        AdmissionPermit {
            _permit: permit,
            in_use: Arc::clone(&self.in_use),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
