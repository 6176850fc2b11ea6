// src/battle/task.rs
//! Task specification, caller budget and peer endpoint
//!
//! These are the only inputs a caller hands to the orchestrator. All of them
//! are validated eagerly in `Orchestrator::start` so that nothing is
//! allocated for a battle that could never run.

use crate::utils::backoff::RetryOverrides;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// How a trajectory is aggregated into `normalized_score`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ScoringRule {
    /// 1.0 on success, 0.0 otherwise
    Binary,

    /// Success weighted by the fraction of step budget left unused
    Efficiency,

    /// Cumulative reward mapped linearly from `[min, max]` onto `[0, 1]`
    Reward { min: f64, max: f64 },

    /// Success gated tidiness heuristics over the action log
    Cleanup,
}

impl Default for ScoringRule {
    fn default() -> Self {
        Self::Binary
    }
}

/// Description of the scenario a battle runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Environment identifier, resolved to a sandbox command by the backend
    pub environment_id: String,

    /// Hard cap on steps for this task
    pub max_steps: u32,

    /// Wall-clock budget in seconds, counted from battle creation
    pub deadline_secs: u64,

    /// Score aggregation rule
    #[serde(default)]
    pub scoring_rule: ScoringRule,

    /// Provisioning retry overrides
    #[serde(default)]
    pub retry: Option<RetryOverrides>,

    /// Opaque scenario parameters forwarded to the environment on reset
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskSpec {
    pub fn new(environment_id: impl Into<String>, max_steps: u32, deadline_secs: u64) -> Self {
        Self {
            environment_id: environment_id.into(),
            max_steps,
            deadline_secs,
            scoring_rule: ScoringRule::default(),
            retry: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_scoring_rule(mut self, rule: ScoringRule) -> Self {
        self.scoring_rule = rule;
        self
    }

    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let task: TaskSpec = serde_yaml::from_str(raw)
            .map_err(|e| EngineError::InvalidConfig(format!("task spec: {}", e)))?;
        task.validate()?;
        Ok(task)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Check that the task is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.environment_id.is_empty() {
            return Err(EngineError::InvalidConfig("environment_id is empty".into()));
        }
        if !self
            .environment_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(EngineError::InvalidConfig(format!(
                "environment_id '{}' contains unsupported characters",
                self.environment_id
            )));
        }
        if self.max_steps == 0 {
            return Err(EngineError::InvalidConfig("task max_steps must be > 0".into()));
        }
        if self.deadline_secs == 0 {
            return Err(EngineError::InvalidConfig("task deadline_secs must be > 0".into()));
        }
        if let ScoringRule::Reward { min, max } = self.scoring_rule {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(EngineError::InvalidConfig(format!(
                    "reward scoring range [{}, {}] is invalid",
                    min, max
                )));
            }
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == Some(0) {
                return Err(EngineError::InvalidConfig(
                    "retry override max_attempts must be >= 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Caller-side resource budget for one battle
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub max_steps: u32,
    pub deadline: DateTime<Utc>,
}

impl Budget {
    pub fn new(max_steps: u32, deadline: DateTime<Utc>) -> Self {
        Self { max_steps, deadline }
    }

    /// Budget that simply mirrors the task's own limits
    pub fn for_task(task: &TaskSpec) -> Self {
        let secs = task.deadline_secs.min(u64::from(u32::MAX)) as i64;
        Self::new(task.max_steps, Utc::now() + ChronoDuration::seconds(secs))
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.max_steps == 0 {
            return Err(EngineError::InvalidConfig("budget max_steps must be > 0".into()));
        }
        if self.deadline <= now {
            return Err(EngineError::InvalidConfig(format!(
                "budget deadline {} is not in the future",
                self.deadline
            )));
        }
        Ok(())
    }
}

/// Remote peer agent assigned to a battle
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Action endpoint, e.g. `http://127.0.0.1:9011/act`
    pub url: String,

    /// Upper bound for a single exchange
    pub timeout_ms: u64,

    /// Bearer token sent with every request
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl PeerEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(EngineError::InvalidConfig("peer timeout must be > 0".into()));
        }
        let uri: hyper::Uri = self
            .url
            .parse()
            .map_err(|e| EngineError::InvalidConfig(format!("peer url '{}': {}", self.url, e)))?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(EngineError::InvalidConfig(format!(
                "peer url '{}' must be an absolute http:// URL",
                self.url
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("url", &self.url)
            .field("timeout_ms", &self.timeout_ms)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
