// src/peer/mod.rs
//! Peer protocol
//!
//! - **protocol**: request/response messages and validation
//! - **http_client**: `HttpPeerClient`, JSON over HTTP/1.1
//!
//! The client is stateless per call and never retries; retry and strike
//! policy belong to the orchestrator.

pub mod http_client;
pub mod protocol;

pub use http_client::HttpPeerClient;
pub use protocol::{PeerRequest, PeerResponse};

use crate::battle::{Action, PeerEndpoint};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Sends one observation to a peer and waits for its action
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fails with `PeerTimeout` once `deadline` passes and with
    /// `PeerProtocol` for any response that is not a valid action.
    async fn exchange(
        &self,
        endpoint: &PeerEndpoint,
        request: &PeerRequest,
        deadline: Instant,
    ) -> Result<Action>;
}

/// Peer protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Consecutive malformed actions before the battle fails
    pub malformed_strike_limit: u32,

    /// TCP connect timeout
    pub connect_timeout_ms: u64,

    /// Largest accepted response body
    pub max_response_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            malformed_strike_limit: 3,
            connect_timeout_ms: 5_000,
            max_response_bytes: 1 << 20,
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.malformed_strike_limit == 0 {
            return Err("peer malformed_strike_limit must be at least 1".to_string());
        }
        if self.max_response_bytes == 0 {
            return Err("peer max_response_bytes cannot be 0".to_string());
        }
        Ok(())
    }
}
