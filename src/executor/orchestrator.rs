// src/executor/orchestrator.rs
//! Battle orchestrator
//!
//! Owns the battle registry and exposes the lifecycle operations. Each
//! battle runs in its own tokio task; the orchestrator only validates
//! inputs, registers the battle and hands it to a `BattleRun`.

use crate::battle::{Battle, BattleId, BattleStatus, Budget, PeerEndpoint, StepRecord, TaskSpec};
use crate::executor::run::BattleRun;
use crate::executor::state::{BattleShared, DiagnosticCommand, COMMAND_QUEUE_DEPTH};
use crate::peer::{HttpPeerClient, PeerClient};
use crate::runtime::{ProcessBackend, SandboxBackend, SandboxManager, SandboxStats};
use crate::telemetry::{Severity, TelemetrySink, TelemetryStats};
use crate::utils::backoff::RetryPolicy;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collaborators shared by every battle run
pub(crate) struct EngineContext {
    pub sandboxes: SandboxManager,
    pub peer: Arc<dyn PeerClient>,
    pub telemetry: Arc<TelemetrySink>,
    pub retry: RetryPolicy,
    pub malformed_strike_limit: u32,
    pub step_retries: u32,
    pub flush_timeout: Duration,
}

/// Entry point for running battles
pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    battles: DashMap<BattleId, Arc<BattleShared>>,
}

impl Orchestrator {
    /// Build an orchestrator with the process backend, HTTP peer client and
    /// HTTP control plane described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(ProcessBackend::new(
            config.sandbox.environments.clone(),
            config.sandbox.terminate_grace(),
        ));
        let peer = Arc::new(HttpPeerClient::new(config.peer.clone()));
        let telemetry = Arc::new(TelemetrySink::from_config(&config.telemetry));

        Self::with_components(config, backend, peer, telemetry)
    }

    /// Build an orchestrator around custom collaborators
    pub fn with_components(
        config: EngineConfig,
        backend: Arc<dyn SandboxBackend>,
        peer: Arc<dyn PeerClient>,
        telemetry: Arc<TelemetrySink>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            capacity = config.sandbox.capacity,
            strike_limit = config.peer.malformed_strike_limit,
            "Initializing battle orchestrator"
        );

        let ctx = EngineContext {
            malformed_strike_limit: config.peer.malformed_strike_limit,
            step_retries: config.sandbox.step_retries,
            flush_timeout: config.telemetry.flush_timeout(),
            retry: config.retry,
            sandboxes: SandboxManager::new(config.sandbox, backend),
            peer,
            telemetry,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            battles: DashMap::new(),
        })
    }

    /// Validate inputs, register a battle and start running it
    pub fn start(&self, task: TaskSpec, endpoint: PeerEndpoint, budget: Budget) -> Result<BattleId> {
        let now = Utc::now();
        task.validate()?;
        endpoint.validate()?;
        budget.validate(now)?;

        let id = BattleId::new();
        let max_steps = budget.max_steps.min(task.max_steps);
        let task_secs = task.deadline_secs.min(u64::from(u32::MAX)) as i64;
        let deadline = budget.deadline.min(now + ChronoDuration::seconds(task_secs));

        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
        let deadline_at = Instant::now() + remaining;

        let mut battle = Battle::new(id, task, endpoint.url.clone(), max_steps, now, deadline);
        let from = battle.status;
        battle
            .transition(BattleStatus::Provisioning)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let shared = Arc::new(BattleShared::new(battle, command_tx));
        self.battles.insert(id, Arc::clone(&shared));

        self.ctx.telemetry.status(id, from, shared.status());
        metrics::counter!("battle_started_total").increment(1);
        info!(battle_id = %id, max_steps, %deadline, peer = %endpoint.url, "Battle accepted");

        let run = BattleRun::new(Arc::clone(&self.ctx), Arc::clone(&shared), endpoint, deadline_at);
        let join = tokio::spawn(run.run(command_rx));
        *shared.task.lock() = Some(join);

        Ok(id)
    }

    /// Snapshot of a battle record
    pub fn status(&self, battle_id: BattleId) -> Result<Battle> {
        Ok(self.get(battle_id)?.snapshot())
    }

    /// Request early termination; a no-op for battles already terminal
    pub fn abort(&self, battle_id: BattleId) -> Result<()> {
        let shared = self.get(battle_id)?;
        let status = shared.status();

        if status.is_terminal() {
            debug!(battle_id = %battle_id, %status, "Abort ignored for terminal battle");
            return Ok(());
        }

        if !shared.cancel.is_cancelled() {
            info!(battle_id = %battle_id, %status, "Abort requested");
            self.ctx
                .telemetry
                .log(battle_id, Severity::Warning, "abort requested");
            shared.cancel.cancel();
        }
        Ok(())
    }

    /// Steps recorded so far
    pub fn trajectory(&self, battle_id: BattleId) -> Result<Vec<StepRecord>> {
        let shared = self.get(battle_id)?;
        let steps = shared.state.read().trajectory.as_slice().to_vec();
        Ok(steps)
    }

    /// Wait until the battle reaches a terminal status
    pub async fn wait(&self, battle_id: BattleId) -> Result<Battle> {
        let shared = self.get(battle_id)?;
        let mut status_rx = shared.status_tx.subscribe();

        let reached = status_rx.wait_for(|status| status.is_terminal()).await.is_ok();
        if !reached {
            return Err(EngineError::BattleNotFound(battle_id));
        }
        Ok(shared.snapshot())
    }

    /// Remove a finished battle from the registry and return its final record
    pub fn archive(&self, battle_id: BattleId) -> Result<Battle> {
        let shared = self.get(battle_id)?;
        let status = shared.status();
        if !status.is_terminal() {
            return Err(EngineError::InvalidConfig(format!(
                "battle {} is still {} and cannot be archived",
                battle_id, status
            )));
        }

        self.battles.remove(&battle_id);
        debug!(battle_id = %battle_id, "Battle archived");
        Ok(shared.snapshot())
    }

    /// Snapshots of every registered battle
    pub fn list(&self) -> Vec<Battle> {
        let mut battles: Vec<Battle> = self.battles.iter().map(|e| e.value().snapshot()).collect();
        battles.sort_by_key(|b| b.id);
        battles
    }

    /// Run a diagnostic command inside a running battle's sandbox.
    ///
    /// The command runs while the battle is waiting on its peer and is
    /// reported to the control plane.
    pub async fn exec(
        &self,
        battle_id: BattleId,
        command: impl Into<String>,
        reported_by: impl Into<String>,
    ) -> Result<String> {
        let shared = self.get(battle_id)?;
        let not_running = || EngineError::SandboxExecution(format!("battle {} is not running", battle_id));

        if shared.status().is_terminal() {
            return Err(not_running());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        shared
            .commands
            .send(DiagnosticCommand {
                command: command.into(),
                reported_by: reported_by.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| not_running())?;

        reply_rx.await.map_err(|_| not_running())?
    }

    /// Abort every live battle, wait for all runs and flush telemetry
    pub async fn shutdown(&self) -> TelemetryStats {
        info!(battles = self.battles.len(), "Shutting down orchestrator");

        let live: Vec<Arc<BattleShared>> = self.battles.iter().map(|e| Arc::clone(e.value())).collect();
        for shared in &live {
            if !shared.status().is_terminal() {
                shared.cancel.cancel();
            }
        }

        for shared in live {
            let join = shared.task.lock().take();
            if let Some(join) = join {
                if let Err(e) = join.await {
                    warn!(battle_id = %shared.id, error = %e, "Battle task ended abnormally");
                }
            }
        }

        self.ctx.telemetry.shutdown(self.ctx.flush_timeout).await
    }

    pub fn sandbox_stats(&self) -> SandboxStats {
        self.ctx.sandboxes.stats()
    }

    pub fn telemetry_stats(&self) -> TelemetryStats {
        self.ctx.telemetry.stats()
    }

    fn get(&self, battle_id: BattleId) -> Result<Arc<BattleShared>> {
        self.battles
            .get(&battle_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::BattleNotFound(battle_id))
    }
}
