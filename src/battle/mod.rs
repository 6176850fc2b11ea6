// src/battle/mod.rs
//! Shared battle data model
//!
//! - **record**: `Battle`, lifecycle status and transition guards
//! - **step**: `StepRecord`, `Trajectory`, `ScoreResult`
//! - **task**: `TaskSpec`, `Budget`, `PeerEndpoint`

pub mod record;
pub mod step;
pub mod task;

pub use record::{
    Battle, BattleId, BattleStatus, Failure, FailureReason, IllegalTransition, RetryCounters,
    StatusTransition, TeardownState,
};
pub use step::{
    Action, Observation, ScoreResult, StepFailureTag, StepOutcome, StepRecord, Trajectory,
};
pub use task::{Budget, PeerEndpoint, ScoringRule, TaskSpec};
