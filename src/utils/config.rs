// src/utils/config.rs
//! Engine configuration
//!
//! Loaded from an optional `battle-engine.{toml,yaml}` file and overridden
//! by `BATTLE_ENGINE__<SECTION>__<KEY>` environment variables, e.g.
//! `BATTLE_ENGINE__SANDBOX__CAPACITY=16`.

use crate::observability::LoggingConfig;
use crate::peer::PeerConfig;
use crate::runtime::sandbox::SandboxConfig;
use crate::telemetry::TelemetryConfig;
use crate::utils::backoff::RetryPolicy;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const DEFAULT_CONFIG_NAME: &str = "battle-engine";
const ENV_PREFIX: &str = "BATTLE_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sandbox admission, timeouts and environment commands
    pub sandbox: SandboxConfig,

    /// Provisioning retry policy (tasks may override)
    pub retry: RetryPolicy,

    /// Peer protocol settings
    pub peer: PeerConfig,

    /// Control-plane telemetry
    pub telemetry: TelemetryConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from `battle-engine.*` in the working directory plus environment
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        Self::finish(builder.build()?)
    }

    /// Load from an explicit file plus environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading engine configuration");

        let builder = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        Self::finish(builder.build()?)
    }

    fn finish(raw: Config) -> Result<Self> {
        let config: EngineConfig = raw.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate().map_err(EngineError::InvalidConfig)?;
        self.retry.validate().map_err(EngineError::InvalidConfig)?;
        self.peer.validate().map_err(EngineError::InvalidConfig)?;
        self.telemetry.validate().map_err(EngineError::InvalidConfig)?;
        Ok(())
    }
}
