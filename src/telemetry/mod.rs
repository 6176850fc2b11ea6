// src/telemetry/mod.rs
//! Control-plane telemetry
//!
//! This module provides fire-and-forget battle reporting:
//!
//! - **event**: event kinds and the control-plane wire body
//! - **event_queue**: bounded drop-oldest buffer
//! - **sink**: background delivery worker with retries
//! - **control_plane**: HTTP delivery target and local JSONL fallback

pub mod control_plane;
pub mod event;
pub mod event_queue;
pub mod sink;

pub use control_plane::{ControlPlane, HttpControlPlane, JsonlFallback};
pub use event::{ControlPlaneUpdate, EventKind, Severity, TelemetryEvent};
pub use event_queue::{EventQueue, QueueStats};
pub use sink::{TelemetrySink, TelemetryStats};

use crate::utils::backoff::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Control plane base URL; telemetry goes only to the fallback when unset
    pub endpoint: Option<String>,

    pub auth_token: Option<String>,

    /// Buffered events before the oldest are dropped
    pub buffer_capacity: usize,

    /// Delivery retry policy per event
    pub retry: RetryPolicy,

    pub request_timeout_ms: u64,

    /// Directory for undeliverable events (`<battle_id>.jsonl`)
    pub fallback_dir: Option<PathBuf>,

    /// How long shutdown waits for pending events
    pub flush_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            buffer_capacity: 4096,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 100,
                max_backoff_ms: 2_000,
                multiplier: 2.0,
                jitter: false,
            },
            request_timeout_ms: 5_000,
            fallback_dir: None,
            flush_timeout_ms: 5_000,
        }
    }
}

impl TelemetryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.buffer_capacity == 0 {
            return Err("telemetry buffer_capacity cannot be 0".to_string());
        }
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") {
                return Err(format!("telemetry endpoint must be http://, got '{}'", endpoint));
            }
        }
        self.retry
            .validate()
            .map_err(|e| format!("telemetry {}", e))
    }
}
