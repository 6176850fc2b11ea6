// src/battle/record.rs
//! Battle record and lifecycle state machine
//!
//! Every battle moves through
//!
//! ```text
//! Pending → Provisioning → Running → Scoring → TearingDown → Completed
//!                │            │                    │      → Failed
//!                └────────────┴────→ TearingDown ──┘      → Aborted
//! ```
//!
//! Teardown precedes every terminal status. `Aborted` may only be decided
//! while the battle was Provisioning or Running, and `Completed` only after
//! Scoring. All transitions are checked against the table in
//! [`is_legal_transition`] and appended to the battle's audit log.

use crate::battle::step::ScoreResult;
use crate::battle::task::TaskSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

/// Globally unique battle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleId(Ulid);

impl BattleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BattleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BattleId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Lifecycle status of a battle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Pending,
    Provisioning,
    Running,
    Scoring,
    TearingDown,
    Completed,
    Failed,
    Aborted,
}

impl BattleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Scoring => "scoring",
            Self::TearingDown => "tearing_down",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal edges of the battle state graph.
///
/// The terminal edge out of `TearingDown` is further constrained by the phase
/// teardown was entered from (see [`Battle::transition`]).
pub fn is_legal_transition(from: BattleStatus, to: BattleStatus) -> bool {
    use BattleStatus::*;

    matches!(
        (from, to),
        (Pending, Provisioning)
            | (Provisioning, Running)
            | (Provisioning, TearingDown)
            | (Running, Scoring)
            | (Running, TearingDown)
            | (Scoring, TearingDown)
            | (TearingDown, Completed)
            | (TearingDown, Failed)
            | (TearingDown, Aborted)
    )
}

/// Serializable classification of why a battle or trajectory did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidConfig,
    Provisioning,
    ResourceExhausted,
    SandboxExecution,
    PeerTimeout,
    PeerProtocol,
    DeadlineExceeded,
    Aborted,
    MaxStepsExhausted,
    MalformedAction,
    NotDone,
    Internal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidConfig => "invalid_config",
            Self::Provisioning => "provisioning",
            Self::ResourceExhausted => "resource_exhausted",
            Self::SandboxExecution => "sandbox_execution",
            Self::PeerTimeout => "peer_timeout",
            Self::PeerProtocol => "peer_protocol",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Aborted => "aborted",
            Self::MaxStepsExhausted => "max_steps_exhausted",
            Self::MalformedAction => "malformed_action",
            Self::NotDone => "not_done",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Failure attached to a Failed or Aborted battle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Retry bookkeeping for one battle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Failed provisioning attempts that were retried or exhausted
    pub provisioning: u32,

    /// Sandbox step executions that were retried
    pub sandbox_step: u32,

    /// Current run of malformed peer actions
    pub consecutive_malformed: u32,
}

/// Result of the single teardown attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum TeardownState {
    NotAttempted,
    Succeeded,
    /// Destruction failed; the instance needs operator cleanup
    FailedNeedsCleanup(String),
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: BattleStatus,
    pub to: BattleStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal battle transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: BattleStatus,
    pub to: BattleStatus,
}

/// Authoritative record of a battle, owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battle {
    pub id: BattleId,
    pub task: TaskSpec,

    /// Peer agent URL (the auth token is never stored here)
    pub peer_url: String,

    pub status: BattleStatus,
    pub created_at: DateTime<Utc>,

    /// Absolute wall-clock bound for the whole battle
    pub deadline: DateTime<Utc>,

    /// Effective step budget
    pub max_steps: u32,

    pub retries: RetryCounters,
    pub steps_taken: u32,
    pub score: Option<ScoreResult>,
    pub failure: Option<Failure>,
    pub teardown: TeardownState,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StatusTransition>,

    /// Phase the battle was in when teardown started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    teardown_from: Option<BattleStatus>,
}

impl Battle {
    pub fn new(
        id: BattleId,
        task: TaskSpec,
        peer_url: String,
        max_steps: u32,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task,
            peer_url,
            status: BattleStatus::Pending,
            created_at,
            deadline,
            max_steps,
            retries: RetryCounters::default(),
            steps_taken: 0,
            score: None,
            failure: None,
            teardown: TeardownState::NotAttempted,
            finished_at: None,
            transitions: Vec::new(),
            teardown_from: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, enforcing the transition table
    pub fn transition(&mut self, to: BattleStatus) -> Result<(), IllegalTransition> {
        let from = self.status;
        let illegal = IllegalTransition { from, to };

        if !is_legal_transition(from, to) {
            return Err(illegal);
        }

        if from == BattleStatus::TearingDown {
            let origin = self.teardown_from;
            let allowed = match to {
                BattleStatus::Aborted => matches!(
                    origin,
                    Some(BattleStatus::Provisioning) | Some(BattleStatus::Running)
                ),
                BattleStatus::Completed => origin == Some(BattleStatus::Scoring),
                _ => true,
            };
            if !allowed {
                return Err(illegal);
            }
        }

        if to == BattleStatus::TearingDown {
            self.teardown_from = Some(from);
        }

        let at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(at);
        }

        debug!(battle_id = %self.id, %from, %to, "Battle status transition");
        self.status = to;
        self.transitions.push(StatusTransition { from, to, at });
        Ok(())
    }

    /// Phase teardown was entered from, if teardown has started
    pub fn teardown_origin(&self) -> Option<BattleStatus> {
        self.teardown_from
    }
}
