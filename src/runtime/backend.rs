// src/runtime/backend.rs
//! Pluggable sandbox backends
//!
//! A backend turns a task spec into a running, stateful environment
//! instance. The sandbox manager owns timeouts, admission and lifecycle
//! status; backends only perform the raw operations.

use crate::battle::{Action, BattleId, Observation, StepOutcome, TaskSpec};
use crate::utils::errors::Result;
use async_trait::async_trait;

/// Launches environment instances
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Start an instance for `battle_id` and return once it is Ready
    async fn launch(&self, battle_id: BattleId, task: &TaskSpec) -> Result<Box<dyn SandboxInstance>>;
}

/// A single running environment instance (single-threaded, stateful)
#[async_trait]
pub trait SandboxInstance: Send {
    /// Opaque reference (container name, pid, ...)
    fn instance_ref(&self) -> &str;

    async fn observe(&mut self) -> Result<Observation>;

    async fn step(&mut self, action: &Action) -> Result<StepOutcome>;

    /// Run a raw diagnostic command inside the instance
    async fn exec(&mut self, command: &str) -> Result<String>;

    async fn terminate(&mut self) -> Result<()>;
}
