// src/utils/errors.rs
//! Error taxonomy for the battle engine
//!
//! Every fallible operation in the engine returns [`EngineError`]. The
//! orchestrator maps errors to a serializable [`FailureReason`] when it records
//! a terminal battle outcome, and asks [`EngineError::is_retriable`] whether a
//! failed provisioning or sandbox step may be attempted again.

use crate::battle::{BattleId, FailureReason};
use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the battle engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Task spec, budget, endpoint or engine configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sandbox instance could not be brought to Ready
    #[error("sandbox provisioning failed: {0}")]
    Provisioning(String),

    /// No admission slot became free within the wait timeout
    #[error("sandbox capacity exhausted after waiting {waited_ms}ms")]
    ResourceExhausted { waited_ms: u64 },

    /// Command failed or timed out inside a running sandbox
    #[error("sandbox execution failed: {0}")]
    SandboxExecution(String),

    /// Peer did not answer before the step deadline
    #[error("peer did not respond to step {step_index} within {timeout_ms}ms")]
    PeerTimeout { step_index: u64, timeout_ms: u64 },

    /// Peer answered with something that is not a valid action response
    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),

    /// Battle wall-clock deadline elapsed
    #[error("battle deadline exceeded")]
    DeadlineExceeded,

    /// Battle was cancelled by an explicit abort
    #[error("battle aborted")]
    Aborted,

    /// Control-plane delivery failure (never surfaced to battle status)
    #[error("telemetry delivery failed: {0}")]
    Telemetry(String),

    /// Sandbox destruction failed; needs out-of-band cleanup
    #[error("sandbox teardown failed: {0}")]
    Teardown(String),

    #[error("battle not found: {0}")]
    BattleNotFound(BattleId),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Failure reason recorded on the battle for this error
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InvalidConfig(_) | Self::Config(_) => FailureReason::InvalidConfig,
            Self::Provisioning(_) => FailureReason::Provisioning,
            Self::ResourceExhausted { .. } => FailureReason::ResourceExhausted,
            Self::SandboxExecution(_) | Self::Io(_) | Self::Serialization(_) => {
                FailureReason::SandboxExecution
            }
            Self::PeerTimeout { .. } => FailureReason::PeerTimeout,
            Self::PeerProtocol(_) => FailureReason::PeerProtocol,
            Self::DeadlineExceeded => FailureReason::DeadlineExceeded,
            Self::Aborted => FailureReason::Aborted,
            Self::Telemetry(_) | Self::Teardown(_) | Self::BattleNotFound(_) => {
                FailureReason::Internal
            }
        }
    }

    /// Whether the orchestrator may retry the failed operation
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Provisioning(_) | Self::SandboxExecution(_))
    }
}
