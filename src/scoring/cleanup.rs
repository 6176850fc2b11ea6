// src/scoring/cleanup.rs
//! Environmental tidiness heuristics over an action log
//!
//! Each ratio is a count divided by the number of steps; the cleanup score
//! is `1 - mean(ratios)`, floored at 0.

use crate::battle::{Action, StepRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-trajectory tidiness ratios
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupMetrics {
    /// Actions identical to the one before
    pub repeated_steps_ratio: f64,

    /// Steps whose reward was zero or missing
    pub no_change_steps_ratio: f64,

    /// Actions that open something
    pub open_items_ratio: f64,

    /// Actions that turn or switch an appliance on
    pub active_appliances_ratio: f64,

    /// Objects put anywhere other than the sink
    pub unrestored_objects_ratio: f64,
}

impl CleanupMetrics {
    pub fn from_steps(steps: &[StepRecord]) -> Self {
        let actions: Vec<String> = steps.iter().map(|s| action_text(&s.action)).collect();
        let total = actions.len().max(1) as f64;

        let count = |pred: &dyn Fn(&str) -> bool| actions.iter().filter(|a| pred(a.as_str())).count() as f64;

        let repeated = actions.windows(2).filter(|w| w[0] == w[1]).count() as f64;
        let no_change = steps
            .iter()
            .filter(|s| s.reward.unwrap_or(0.0) == 0.0)
            .count() as f64;

        Self {
            repeated_steps_ratio: repeated / total,
            no_change_steps_ratio: no_change / total,
            open_items_ratio: count(&|a| a.contains("open")) / total,
            active_appliances_ratio: count(&|a| a.contains("turn on") || a.contains("switch on")) / total,
            unrestored_objects_ratio: count(&|a| a.contains("put") && !a.contains("sink")) / total,
        }
    }

    pub fn score(&self) -> f64 {
        let mean = (self.repeated_steps_ratio
            + self.no_change_steps_ratio
            + self.open_items_ratio
            + self.active_appliances_ratio
            + self.unrestored_objects_ratio)
            / 5.0;
        (1.0 - mean).max(0.0)
    }
}

fn action_text(action: &Action) -> String {
    match action {
        Value::String(s) => s.to_lowercase(),
        Value::Null => String::new(),
        other => other.to_string().to_lowercase(),
    }
}
