// src/utils/backoff.rs
//! Bounded exponential backoff shared by provisioning retries and
//! telemetry delivery.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Per-task overrides; unset fields keep the engine-wide policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

impl RetryPolicy {
    /// Apply task-level overrides on top of this policy
    pub fn with_overrides(&self, overrides: Option<&RetryOverrides>) -> Self {
        let mut policy = self.clone();
        if let Some(o) = overrides {
            if let Some(n) = o.max_attempts {
                policy.max_attempts = n;
            }
            if let Some(ms) = o.initial_backoff_ms {
                policy.initial_backoff_ms = ms;
            }
            if let Some(ms) = o.max_backoff_ms {
                policy.max_backoff_ms = ms;
            }
        }
        policy
    }

    /// Delay to wait after `failed_attempts` consecutive failures (1-based)
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0);

        let millis = if self.jitter && capped > 0.0 {
            let spread = capped * 0.25;
            capped + rand::random::<f64>() * spread
        } else {
            capped
        };

        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if self.multiplier < 1.0 {
            return Err("retry multiplier cannot be below 1.0".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial backoff cannot exceed max backoff".to_string());
        }
        Ok(())
    }
}
