// src/telemetry/event.rs
//! Telemetry events and their control-plane wire form

use crate::battle::{BattleId, BattleStatus, ScoreResult, StepRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reporter name used for engine-originated updates
pub const ENGINE_REPORTER: &str = "battle-engine";

/// Characters of diagnostic command output kept on a `Command` event
pub const COMMAND_OUTPUT_LIMIT: usize = 1000;

/// Log severity carried by `EventKind::Log`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Event recorded for a battle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub battle_id: BattleId,

    /// Sink-wide sequence number, increasing in record order
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Log {
        message: String,
        severity: Severity,
        #[serde(default)]
        detail: Option<Value>,
    },
    Status {
        from: BattleStatus,
        to: BattleStatus,
    },
    Step(StepRecord),
    Result(ScoreResult),

    /// A command executed inside the sandbox on behalf of an agent
    Command {
        command: String,
        reported_by: String,

        /// Output (or error text), capped at `COMMAND_OUTPUT_LIMIT` characters
        #[serde(default)]
        output: String,
    },
}

impl EventKind {
    /// Command event with its output capped
    pub fn command(command: String, reported_by: String, output: &str) -> Self {
        Self::Command {
            command,
            reported_by,
            output: output.chars().take(COMMAND_OUTPUT_LIMIT).collect(),
        }
    }
}

/// Body POSTed to the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneUpdate {
    pub is_result: bool,
    pub message: String,
    pub reported_by: String,
    pub timestamp: DateTime<Utc>,
    pub detail: Value,

    /// Human-readable summary rendered by the control plane UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_content: Option<String>,
}

impl TelemetryEvent {
    pub fn is_result(&self) -> bool {
        matches!(self.kind, EventKind::Result(_))
    }

    pub fn to_update(&self) -> ControlPlaneUpdate {
        let markdown_content = match &self.kind {
            EventKind::Result(score) => Some(score_markdown(score)),
            _ => None,
        };

        let (message, reported_by, detail) = match &self.kind {
            EventKind::Log {
                message,
                severity,
                detail,
            } => (
                message.clone(),
                ENGINE_REPORTER.to_string(),
                json!({ "severity": severity, "detail": detail }),
            ),
            EventKind::Status { from, to } => (
                format!("status {} -> {}", from.as_str(), to.as_str()),
                ENGINE_REPORTER.to_string(),
                json!({ "from": from, "to": to }),
            ),
            EventKind::Step(step) => (
                format!("step {}", step.index),
                ENGINE_REPORTER.to_string(),
                serde_json::to_value(step).unwrap_or(Value::Null),
            ),
            EventKind::Result(score) => (
                if score.success {
                    "battle succeeded".to_string()
                } else {
                    "battle did not succeed".to_string()
                },
                ENGINE_REPORTER.to_string(),
                serde_json::to_value(score).unwrap_or(Value::Null),
            ),
            EventKind::Command {
                command,
                reported_by,
                output,
            } => (
                command.clone(),
                reported_by.clone(),
                json!({ "command": command, "output": output }),
            ),
        };

        ControlPlaneUpdate {
            is_result: self.is_result(),
            message,
            reported_by,
            timestamp: self.timestamp,
            detail,
            markdown_content,
        }
    }
}

fn score_markdown(score: &ScoreResult) -> String {
    let mut md = String::from("| metric | value |\n|---|---|\n");
    md.push_str(&format!("| success | {} |\n", score.success));
    md.push_str(&format!("| steps | {} |\n", score.steps_taken));
    md.push_str(&format!("| score | {:.3} |\n", score.normalized_score));
    md.push_str(&format!("| total reward | {:.3} |\n", score.total_reward));
    md.push_str(&format!("| peer time (ms) | {} |\n", score.peer_time_ms));
    if let Some(reason) = score.failure_reason {
        md.push_str(&format!("| failure | {} |\n", reason));
    }
    if let Some(cleanup) = &score.cleanup {
        for (name, ratio) in [
            ("repeated steps", cleanup.repeated_steps_ratio),
            ("no-change steps", cleanup.no_change_steps_ratio),
            ("open items", cleanup.open_items_ratio),
            ("active appliances", cleanup.active_appliances_ratio),
            ("unrestored objects", cleanup.unrestored_objects_ratio),
        ] {
            md.push_str(&format!("| {} | {:.3} |\n", name, ratio));
        }
    }
    md
}
