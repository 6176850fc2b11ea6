// src/scoring/mod.rs
//! Trajectory scoring
//!
//! Pure functions from a trajectory and its task to a `ScoreResult`.
//! Success means the final step reported `done` and carries no failure tag.
//! `normalized_score` depends on the task's `ScoringRule` and is always
//! clamped to `[0.0, 1.0]`.

pub mod cleanup;

pub use cleanup::CleanupMetrics;

use crate::battle::{FailureReason, ScoreResult, ScoringRule, StepRecord, TaskSpec};

/// Score a trajectory
pub fn score(steps: &[StepRecord], task: &TaskSpec) -> ScoreResult {
    let (success, failure_reason) = match steps.last() {
        Some(last) if last.done && last.failure_tag.is_none() => (true, None),
        Some(last) => (
            false,
            Some(last.failure_tag.map(Into::into).unwrap_or(FailureReason::NotDone)),
        ),
        None => (false, Some(FailureReason::NotDone)),
    };
    build(steps, task, success, failure_reason)
}

/// Score a trajectory the orchestrator already decided has failed
pub fn score_failed(steps: &[StepRecord], task: &TaskSpec, reason: FailureReason) -> ScoreResult {
    build(steps, task, false, Some(reason))
}

fn build(
    steps: &[StepRecord],
    task: &TaskSpec,
    success: bool,
    failure_reason: Option<FailureReason>,
) -> ScoreResult {
    let steps_taken = u32::try_from(steps.len()).unwrap_or(u32::MAX);
    let total_reward: f64 = steps
        .iter()
        .filter_map(|s| s.reward)
        .filter(|r| r.is_finite())
        .sum();

    let peer_time_ms = steps.iter().map(|s| s.peer_elapsed_ms).fold(0u64, u64::saturating_add);
    let mut cleanup = None;

    let raw = match &task.scoring_rule {
        ScoringRule::Binary => {
            if success {
                1.0
            } else {
                0.0
            }
        }
        ScoringRule::Efficiency => {
            if success && task.max_steps > 0 {
                1.0 - f64::from(steps_taken.saturating_sub(1)) / f64::from(task.max_steps)
            } else {
                0.0
            }
        }
        ScoringRule::Reward { min, max } => {
            if max > min {
                (total_reward - min) / (max - min)
            } else {
                0.0
            }
        }
        ScoringRule::Cleanup => {
            let metrics = CleanupMetrics::from_steps(steps);
            let raw = if success { metrics.score() } else { 0.0 };
            cleanup = Some(metrics);
            raw
        }
    };

    ScoreResult {
        success,
        steps_taken,
        normalized_score: clamp_unit(raw),
        total_reward,
        peer_time_ms,
        failure_reason: if success { None } else { failure_reason },
        cleanup,
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
