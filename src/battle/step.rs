// src/battle/step.rs
//! Trajectory data: step records and the final score

use crate::battle::record::{BattleId, FailureReason};
use crate::scoring::CleanupMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observation payload produced by the environment
pub type Observation = serde_json::Value;

/// Action payload produced by the peer agent
pub type Action = serde_json::Value;

/// Why a single step did not count as a regular environment step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureTag {
    /// Peer response failed validation; recorded as a no-op
    MalformedAction,
}

impl From<StepFailureTag> for FailureReason {
    fn from(tag: StepFailureTag) -> Self {
        match tag {
            StepFailureTag::MalformedAction => FailureReason::MalformedAction,
        }
    }
}

/// One observation → action → environment-update cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub battle_id: BattleId,

    /// Position in the trajectory, starting at 0
    pub index: u64,

    /// Observation the peer acted on
    pub observation: Observation,

    /// Action the peer returned (`null` for malformed steps)
    pub action: Action,

    /// Reward reported by the environment, if any
    pub reward: Option<f64>,

    /// Environment signalled episode end
    pub done: bool,

    pub timestamp: DateTime<Utc>,

    /// Peer round-trip time for the exchange that produced this step
    #[serde(default)]
    pub peer_elapsed_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_tag: Option<StepFailureTag>,
}

/// Outcome of applying an action inside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub observation: Observation,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub done: bool,
}

/// Append-only, gap-free sequence of step records for one battle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    steps: Vec<StepRecord>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next appended record must carry
    pub fn next_index(&self) -> u64 {
        self.steps.len() as u64
    }

    /// Append a record; rejects it unless its index is exactly `next_index()`
    pub fn push(&mut self, record: StepRecord) -> Result<(), StepRecord> {
        if record.index != self.next_index() {
            return Err(record);
        }
        self.steps.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn as_slice(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn into_inner(self) -> Vec<StepRecord> {
        self.steps
    }
}

/// Final result of a battle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub success: bool,
    pub steps_taken: u32,

    /// Aggregated score in `[0.0, 1.0]`
    pub normalized_score: f64,

    /// Sum of all reported rewards
    pub total_reward: f64,

    /// Cumulative peer response time over the trajectory
    #[serde(default)]
    pub peer_time_ms: u64,

    /// Set only when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// Per-ratio breakdown, present for the cleanup rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupMetrics>,
}
