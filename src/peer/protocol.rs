// src/peer/protocol.rs
//! Peer protocol messages and response validation
//!
//! ```text
//! request  {battle_id, step_index, observation, deadline_hint_ms}
//! response {battle_id, step_index, action}
//! ```

use crate::battle::{Action, BattleId, Observation};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Observation sent to the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub battle_id: BattleId,
    pub step_index: u64,
    pub observation: Observation,

    /// Milliseconds the peer has before its answer is ignored
    pub deadline_hint_ms: u64,
}

/// Action returned by the peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerResponse {
    pub battle_id: String,
    pub step_index: u64,
    pub action: Action,
}

/// Parse and validate a raw response body against the outstanding request
pub fn parse_response(body: &[u8], request: &PeerRequest) -> Result<Action> {
    let response: PeerResponse = serde_json::from_slice(body)
        .map_err(|e| EngineError::PeerProtocol(format!("response is not a valid action message: {}", e)))?;
    validate_response(response, request)
}

pub fn validate_response(response: PeerResponse, request: &PeerRequest) -> Result<Action> {
    if response.battle_id != request.battle_id.to_string() {
        return Err(EngineError::PeerProtocol(format!(
            "response for battle {} does not match battle {}",
            response.battle_id, request.battle_id
        )));
    }

    if response.step_index != request.step_index {
        return Err(EngineError::PeerProtocol(format!(
            "response for step {} does not match outstanding step {}",
            response.step_index, request.step_index
        )));
    }

    match response.action {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(EngineError::PeerProtocol("action is empty".into()));
            }
            Ok(Value::String(trimmed.to_string()))
        }
        Value::Object(map) if !map.is_empty() => Ok(Value::Object(map)),
        other => Err(EngineError::PeerProtocol(format!(
            "action must be a non-empty string or object, got {}",
            other
        ))),
    }
}
