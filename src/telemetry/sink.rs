// src/telemetry/sink.rs
//! Non-blocking telemetry sink
//!
//! `record` only pushes into a bounded buffer; a single background worker
//! drains it in FIFO order and delivers each event to the control plane with
//! bounded retries. Events the control plane never accepts go to the local
//! JSONL fallback when one is configured, otherwise they are counted as
//! failed. Nothing here can fail or block a battle.
//!
//! ```text
//! record() ──► EventQueue (drop-oldest) ──► worker ──► ControlPlane
//!                                               └──(exhausted)──► JsonlFallback
//! ```

use crate::battle::{BattleId, BattleStatus, ScoreResult, StepRecord};
use crate::telemetry::control_plane::{ControlPlane, HttpControlPlane, JsonlFallback};
use crate::telemetry::event::{EventKind, Severity, TelemetryEvent};
use crate::telemetry::event_queue::EventQueue;
use crate::telemetry::TelemetryConfig;
use crate::utils::backoff::RetryPolicy;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Poll interval used by `flush`
const FLUSH_POLL: Duration = Duration::from_millis(10);

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub recorded: u64,
    pub delivered: u64,

    /// Evicted from a full buffer
    pub dropped: u64,

    /// Written to the local fallback log
    pub fallback: u64,

    /// Neither delivered nor written locally
    pub failed: u64,

    /// Recorded but not yet settled
    pub pending: u64,
}

struct SinkShared {
    queue: EventQueue,
    notify: Notify,
    sequence: AtomicU64,
    outstanding: AtomicU64,
    delivered: AtomicU64,
    fallback_count: AtomicU64,
    failed: AtomicU64,
    control_plane: Option<Arc<dyn ControlPlane>>,
    fallback: Option<JsonlFallback>,
    retry: RetryPolicy,
}

/// Per-engine telemetry sink shared by all battles
pub struct TelemetrySink {
    shared: Arc<SinkShared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetrySink {
    /// Create a sink and start its worker (must be called inside a runtime)
    pub fn new(config: &TelemetryConfig, control_plane: Option<Arc<dyn ControlPlane>>) -> Self {
        let shared = Arc::new(SinkShared {
            queue: EventQueue::new(config.buffer_capacity),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            outstanding: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            fallback_count: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            control_plane,
            fallback: config.fallback_dir.clone().map(JsonlFallback::new),
            retry: config.retry.clone(),
        });

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), cancel.clone()));

        info!(
            capacity = config.buffer_capacity,
            control_plane = shared.control_plane.is_some(),
            fallback = shared.fallback.is_some(),
            "Telemetry sink started"
        );

        Self {
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Create a sink delivering to the configured HTTP endpoint, if any
    pub fn from_config(config: &TelemetryConfig) -> Self {
        let control_plane = config.endpoint.as_ref().map(|endpoint| {
            Arc::new(HttpControlPlane::new(
                endpoint.clone(),
                config.auth_token.clone(),
                config.request_timeout(),
            )) as Arc<dyn ControlPlane>
        });
        Self::new(config, control_plane)
    }

    /// A sink with neither control plane nor fallback discards everything
    pub fn is_enabled(&self) -> bool {
        self.shared.control_plane.is_some() || self.shared.fallback.is_some()
    }

    /// Record an event (non-blocking)
    pub fn record(&self, battle_id: BattleId, kind: EventKind) {
        if !self.is_enabled() {
            trace!(battle_id = %battle_id, "Telemetry disabled, event discarded");
            return;
        }

        let event = TelemetryEvent {
            battle_id,
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            kind,
        };

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(evicted) = self.shared.queue.push(event) {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!("battle_telemetry_events_total", "outcome" => "dropped").increment(1);
            debug!(
                battle_id = %evicted.battle_id,
                sequence = evicted.sequence,
                "Telemetry buffer full, dropped oldest event"
            );
        }
        self.shared.notify.notify_one();
    }

    pub fn log(&self, battle_id: BattleId, severity: Severity, message: impl Into<String>) {
        self.record(
            battle_id,
            EventKind::Log {
                message: message.into(),
                severity,
                detail: None,
            },
        );
    }

    pub fn status(&self, battle_id: BattleId, from: BattleStatus, to: BattleStatus) {
        self.record(battle_id, EventKind::Status { from, to });
    }

    pub fn step(&self, record: &StepRecord) {
        self.record(record.battle_id, EventKind::Step(record.clone()));
    }

    pub fn result(&self, battle_id: BattleId, score: &ScoreResult) {
        self.record(battle_id, EventKind::Result(score.clone()));
    }

    /// Report a command an agent ran inside its sandbox, with its output
    pub fn command(
        &self,
        battle_id: BattleId,
        command: impl Into<String>,
        reported_by: impl Into<String>,
        output: &str,
    ) {
        self.record(
            battle_id,
            EventKind::command(command.into(), reported_by.into(), output),
        );
    }

    /// Wait until every recorded event is settled; false on timeout
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.shared.notify.notify_one();

        let settled = async {
            while self.shared.outstanding.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(FLUSH_POLL).await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }

    pub fn stats(&self) -> TelemetryStats {
        let queue = self.shared.queue.stats();
        TelemetryStats {
            recorded: queue.push_count,
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: queue.drop_count,
            fallback: self.shared.fallback_count.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            pending: self.shared.outstanding.load(Ordering::Relaxed),
        }
    }

    /// Flush for up to `timeout`, then stop the worker
    pub async fn shutdown(&self, timeout: Duration) -> TelemetryStats {
        info!("Shutting down telemetry sink");

        if !self.flush(timeout).await {
            warn!(pending = self.stats().pending, "Telemetry flush timed out");
        }

        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }

        self.stats()
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(shared: Arc<SinkShared>, cancel: CancellationToken) {
    debug!("Telemetry worker started");

    loop {
        while let Some(event) = shared.queue.try_pop() {
            shared.dispatch(event, &cancel).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
        }
    }

    // Control plane is no longer tried once stopped
    while let Some(event) = shared.queue.try_pop() {
        shared.settle_undelivered(&event).await;
    }

    debug!("Telemetry worker stopped");
}

impl SinkShared {
    async fn dispatch(&self, event: TelemetryEvent, cancel: &CancellationToken) {
        let delivered = match &self.control_plane {
            Some(plane) => self.deliver_with_retry(plane.as_ref(), &event, cancel).await,
            None => false,
        };

        if delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!("battle_telemetry_events_total", "outcome" => "delivered").increment(1);
        } else {
            self.settle_undelivered(&event).await;
        }
    }

    async fn deliver_with_retry(
        &self,
        plane: &dyn ControlPlane,
        event: &TelemetryEvent,
        cancel: &CancellationToken,
    ) -> bool {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match plane.deliver(event).await {
                Ok(()) => return true,
                Err(e) if attempt < max_attempts => {
                    debug!(
                        battle_id = %event.battle_id,
                        sequence = event.sequence,
                        attempt,
                        error = %e,
                        "Telemetry delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        battle_id = %event.battle_id,
                        sequence = event.sequence,
                        attempts = max_attempts,
                        error = %e,
                        "Telemetry delivery exhausted retries"
                    );
                }
            }
        }
        false
    }

    async fn settle_undelivered(&self, event: &TelemetryEvent) {
        let written = match &self.fallback {
            Some(fallback) => match fallback.append(event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(battle_id = %event.battle_id, error = %e, "Telemetry fallback write failed");
                    false
                }
            },
            None => false,
        };

        if written {
            self.fallback_count.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("battle_telemetry_events_total", "outcome" => "fallback").increment(1);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("battle_telemetry_events_total", "outcome" => "failed").increment(1);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
