// src/runtime/sandbox.rs
//! Sandbox manager: one isolated environment instance per battle
//!
//! Provides:
//! - Admission control (bounded number of live instances)
//! - Startup, command and destroy timeouts around every backend call
//! - Handle lifecycle tracking (Starting → Ready ⇄ Busy → Destroying → Destroyed)
//! - Idempotent destruction
//!
//! A command that times out leaves the instance mid-request, so the handle
//! turns `Errored` and accepts nothing but `destroy`. A command future
//! dropped by the caller leaves the handle `Busy` with the same effect.

use crate::battle::{Action, BattleId, Observation, StepOutcome, TaskSpec};
use crate::runtime::admission::{AdmissionPermit, AdmissionPool};
use crate::runtime::backend::{SandboxBackend, SandboxInstance};
use crate::runtime::process_manager::EnvironmentCommand;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum concurrently live sandboxes on this host
    pub capacity: usize,

    /// How long `provision` waits for a free slot
    pub admission_wait_ms: u64,

    /// Time an instance has to reach Ready
    pub startup_timeout_ms: u64,

    /// Bound for observe / step / exec
    pub command_timeout_ms: u64,

    /// Bound for destroy
    pub destroy_timeout_ms: u64,

    /// Extra attempts for a failed sandbox step
    pub step_retries: u32,

    /// Grace period between SIGTERM and SIGKILL
    pub terminate_grace_ms: u64,

    /// Environment id → command used by the process backend
    pub environments: HashMap<String, EnvironmentCommand>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            admission_wait_ms: 30_000,
            startup_timeout_ms: 60_000,
            command_timeout_ms: 30_000,
            destroy_timeout_ms: 15_000,
            step_retries: 1,
            terminate_grace_ms: 5_000,
            environments: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capacity == 0 {
            return Err("sandbox capacity cannot be 0".to_string());
        }
        if self.startup_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err("sandbox startup and command timeouts must be > 0".to_string());
        }
        if self.destroy_timeout_ms == 0 {
            return Err("sandbox destroy timeout must be > 0".to_string());
        }
        if self.step_retries > 5 {
            return Err("sandbox step_retries cannot exceed 5".to_string());
        }
        for (id, command) in &self.environments {
            if command.program.is_empty() {
                return Err(format!("environment '{}' has an empty program", id));
            }
        }
        Ok(())
    }
}

/// Lifecycle status of a sandbox handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Ready,
    Busy,
    Destroying,
    Destroyed,
    Errored,
}

/// Exclusive handle to one battle's sandbox. Not `Clone`: exactly one
/// handle exists per battle.
pub struct SandboxHandle {
    battle_id: BattleId,
    status: SandboxStatus,
    instance: Option<Box<dyn SandboxInstance>>,
    instance_ref: Option<String>,
    permit: Option<AdmissionPermit>,
    launch_attempts: u32,
}

impl SandboxHandle {
    pub fn battle_id(&self) -> BattleId {
        self.battle_id
    }

    pub fn status(&self) -> SandboxStatus {
        self.status
    }

    pub fn instance_ref(&self) -> Option<&str> {
        self.instance_ref.as_deref()
    }

    /// Backend launches attempted through this handle
    pub fn launch_attempts(&self) -> u32 {
        self.launch_attempts
    }

    fn begin_command(&mut self) -> Result<&mut Box<dyn SandboxInstance>> {
        if self.status != SandboxStatus::Ready {
            return Err(EngineError::SandboxExecution(format!(
                "sandbox for battle {} is {:?}, not ready",
                self.battle_id, self.status
            )));
        }
        match self.instance.as_mut() {
            Some(instance) => {
                self.status = SandboxStatus::Busy;
                Ok(instance)
            }
            None => Err(EngineError::SandboxExecution(format!(
                "sandbox for battle {} has no instance",
                self.battle_id
            ))),
        }
    }

    fn end_command(&mut self, timed_out: bool) {
        if self.status != SandboxStatus::Busy {
            return;
        }
        if timed_out {
            warn!(battle_id = %self.battle_id, "Sandbox command timed out; instance is no longer usable");
            self.status = SandboxStatus::Errored;
        } else {
            self.status = SandboxStatus::Ready;
        }
    }

    /// Whether the handle can still run commands
    pub fn is_usable(&self) -> bool {
        self.status == SandboxStatus::Ready
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("battle_id", &self.battle_id)
            .field("status", &self.status)
            .field("instance_ref", &self.instance_ref)
            .field("holds_slot", &self.permit.is_some())
            .finish()
    }
}

/// Sandbox counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStats {
    pub capacity: usize,
    pub live: usize,
    pub provisioned: u64,
    pub launch_failures: u64,
    pub destroyed: u64,
    pub teardown_failures: u64,
}

/// Manages sandbox lifecycle across all battles
pub struct SandboxManager {
    config: SandboxConfig,
    backend: Arc<dyn SandboxBackend>,
    admission: AdmissionPool,
    provisioned: AtomicU64,
    launch_failures: AtomicU64,
    destroyed: AtomicU64,
    teardown_failures: AtomicU64,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        info!(capacity = config.capacity, "Initializing sandbox manager");
        let admission = AdmissionPool::new(config.capacity);

        Self {
            config,
            backend,
            admission,
            provisioned: AtomicU64::new(0),
            launch_failures: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create the battle's handle. No resources are held yet.
    pub fn open(&self, battle_id: BattleId) -> SandboxHandle {
        SandboxHandle {
            battle_id,
            status: SandboxStatus::Starting,
            instance: None,
            instance_ref: None,
            permit: None,
            launch_attempts: 0,
        }
    }

    /// Acquire a slot (if not already held) and launch an instance.
    ///
    /// May be called again on the same handle after a `Provisioning` error;
    /// the admission slot is kept across attempts.
    pub async fn provision(&self, handle: &mut SandboxHandle, task: &TaskSpec) -> Result<()> {
        match handle.status {
            SandboxStatus::Starting | SandboxStatus::Errored if handle.instance.is_none() => {}
            other => {
                return Err(EngineError::Provisioning(format!(
                    "sandbox for battle {} cannot be provisioned from {:?}",
                    handle.battle_id, other
                )));
            }
        }

        if handle.permit.is_none() {
            let permit = self.admission.acquire(self.config.admission_wait()).await?;
            handle.permit = Some(permit);
        }

        handle.launch_attempts += 1;
        handle.status = SandboxStatus::Starting;
        debug!(
            battle_id = %handle.battle_id,
            attempt = handle.launch_attempts,
            environment = %task.environment_id,
            "Launching sandbox instance"
        );

        let startup = self.config.startup_timeout();
        let launched =
            match tokio::time::timeout(startup, self.backend.launch(handle.battle_id, task)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Provisioning(format!(
                    "instance did not become ready within {}ms",
                    startup.as_millis()
                ))),
            };

        match launched {
            Ok(instance) => {
                let instance_ref = instance.instance_ref().to_string();
                info!(battle_id = %handle.battle_id, %instance_ref, "Sandbox ready");
                handle.instance_ref = Some(instance_ref);
                handle.instance = Some(instance);
                handle.status = SandboxStatus::Ready;
                self.provisioned.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("battle_sandbox_provisioned_total").increment(1);
                Ok(())
            }
            Err(e) => {
                warn!(battle_id = %handle.battle_id, error = %e, "Sandbox launch failed");
                handle.status = SandboxStatus::Errored;
                self.launch_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("battle_sandbox_launch_failures_total").increment(1);
                Err(match e {
                    EngineError::Provisioning(_) => e,
                    other => EngineError::Provisioning(other.to_string()),
                })
            }
        }
    }

    /// Current observation without advancing the environment
    pub async fn observe(&self, handle: &mut SandboxHandle) -> Result<Observation> {
        let timeout = self.config.command_timeout();
        let instance = handle.begin_command()?;
        let (result, timed_out) = bounded(timeout, "observe", instance.observe()).await;
        handle.end_command(timed_out);
        result
    }

    /// Apply an action and return the environment's response
    pub async fn step(&self, handle: &mut SandboxHandle, action: &Action) -> Result<StepOutcome> {
        let timeout = self.config.command_timeout();
        let instance = handle.begin_command()?;
        let (result, timed_out) = bounded(timeout, "step", instance.step(action)).await;
        handle.end_command(timed_out);
        result
    }

    /// Run a diagnostic command inside the instance
    pub async fn exec(&self, handle: &mut SandboxHandle, command: &str) -> Result<String> {
        let timeout = self.config.command_timeout();
        let instance = handle.begin_command()?;
        let (result, timed_out) = bounded(timeout, "exec", instance.exec(command)).await;
        handle.end_command(timed_out);
        result
    }

    /// Destroy the instance and release the slot. Idempotent.
    ///
    /// The handle ends up Destroyed even when the backend fails; the error is
    /// returned so the caller can flag the instance for manual cleanup.
    pub async fn destroy(&self, handle: &mut SandboxHandle) -> Result<()> {
        if handle.status == SandboxStatus::Destroyed {
            debug!(battle_id = %handle.battle_id, "Sandbox already destroyed");
            return Ok(());
        }

        handle.status = SandboxStatus::Destroying;
        let timeout = self.config.destroy_timeout();

        let result = match handle.instance.take() {
            Some(mut instance) => {
                debug!(battle_id = %handle.battle_id, instance_ref = instance.instance_ref(), "Destroying sandbox");
                match tokio::time::timeout(timeout, instance.terminate()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(EngineError::Teardown(e.to_string())),
                    Err(_) => Err(EngineError::Teardown(format!(
                        "terminate did not finish within {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
            None => Ok(()),
        };

        handle.permit = None;
        handle.status = SandboxStatus::Destroyed;
        self.destroyed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = &result {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("battle_sandbox_teardown_failures_total").increment(1);
            warn!(
                battle_id = %handle.battle_id,
                instance_ref = handle.instance_ref.as_deref().unwrap_or("-"),
                error = %e,
                "Sandbox teardown failed; instance needs manual cleanup"
            );
        }

        result
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            capacity: self.admission.capacity(),
            live: self.admission.in_use(),
            provisioned: self.provisioned.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
        }
    }
}

/// Run an instance command under `timeout`; the flag reports a timeout
async fn bounded<T>(
    timeout: Duration,
    op: &str,
    fut: impl Future<Output = Result<T>>,
) -> (Result<T>, bool) {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => (Ok(value), false),
        Ok(Err(EngineError::SandboxExecution(msg))) => {
            (Err(EngineError::SandboxExecution(msg)), false)
        }
        Ok(Err(other)) => (
            Err(EngineError::SandboxExecution(format!("{}: {}", op, other))),
            false,
        ),
        Err(_) => (
            Err(EngineError::SandboxExecution(format!(
                "{} timed out after {}ms",
                op,
                timeout.as_millis()
            ))),
            true,
        ),
    }
}
