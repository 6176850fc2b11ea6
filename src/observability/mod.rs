// src/observability/mod.rs
//! Observability setup
//!
//! Provides:
//! - `init_tracing`: tracing subscriber with env filter and optional JSON output
//! - `init_metrics`: Prometheus recorder for the `metrics` facade
//!
//! Metrics emitted by the engine:
//!
//! ```text
//! battle_started_total                  counter
//! battle_terminal_total{status}         counter
//! battle_steps_total                    counter
//! battle_malformed_actions_total        counter
//! battle_duration_seconds               histogram
//! battle_peer_exchange_seconds          histogram
//! battle_sandbox_slots_in_use           gauge
//! battle_sandbox_provisioned_total      counter
//! battle_telemetry_events_total{outcome} counter
//! ```

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,

    /// Emit one JSON object per line
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| EngineError::InvalidConfig(format!("log level '{}': {}", self.level, e))),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    installed.map_err(|e| EngineError::InvalidConfig(format!("tracing subscriber: {}", e)))?;
    info!(level = %config.level, json = config.json, "Tracing initialized");
    Ok(())
}

/// Install the Prometheus recorder, optionally serving `/metrics` on `listen`
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();

    let handle = match listen {
        None => builder
            .install_recorder()
            .map_err(|e| EngineError::InvalidConfig(format!("metrics recorder: {}", e)))?,
        Some(addr) => {
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| EngineError::InvalidConfig(format!("metrics exporter: {}", e)))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|_| {
                EngineError::InvalidConfig("a metrics recorder is already installed".into())
            })?;

            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    warn!(error = ?e, "Prometheus exporter stopped");
                }
            });
            info!(%addr, "Prometheus exporter listening");
            handle
        }
    };

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggingConfig {
            level: "battle_engine=loud".to_string(),
            json: false,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(config.env_filter(), Err(EngineError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_metrics_recorder_renders() {
        let handle = init_metrics(None).unwrap();
        metrics::counter!("battle_started_total").increment(1);
        assert!(handle.render().contains("battle_started_total"));
    }
}
