// src/runtime/process_manager.rs
//! Process backend: one environment process per battle
//!
//! Each environment id maps to a command (a local simulator, or e.g.
//! `docker run -i --rm <image>` for containerised environments). The engine
//! talks to the process with newline-delimited JSON over stdin/stdout:
//!
//! ```text
//! instance → engine   {"ready": true}
//! engine → instance   {"op":"reset","battle_id":..,"environment":..,"params":..}
//! engine → instance   {"op":"observe"} | {"op":"step","action":..} | {"op":"exec","command":..}
//! instance → engine   {"observation":..,"reward":..,"done":..} | {"output":..} | {"error":..}
//! ```
//!
//! Requests and replies are paired strictly in order. If a request is
//! abandoned before its reply is read, the instance refuses further requests.

use crate::battle::{Action, BattleId, Observation, StepOutcome, TaskSpec};
use crate::runtime::backend::{SandboxBackend, SandboxInstance};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

/// Longest accepted protocol line (1 MiB)
const MAX_LINE_BYTES: usize = 1 << 20;

/// Command used to start an environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentCommand {
    /// Executable, resolved through PATH
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub work_dir: Option<String>,
}

impl EnvironmentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Spawns environment processes
pub struct ProcessBackend {
    environments: HashMap<String, EnvironmentCommand>,
    terminate_grace: Duration,
}

impl ProcessBackend {
    pub fn new(environments: HashMap<String, EnvironmentCommand>, terminate_grace: Duration) -> Self {
        Self {
            environments,
            terminate_grace,
        }
    }

    fn spawn(&self, battle_id: BattleId, command: &EnvironmentCommand) -> Result<Child> {
        debug!(battle_id = %battle_id, program = %command.program, "Spawning environment process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .env("BATTLE_ID", battle_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(work_dir) = &command.work_dir {
            cmd.current_dir(work_dir);
        }

        cmd.spawn().map_err(|e| {
            EngineError::Provisioning(format!("failed to spawn '{}': {}", command.program, e))
        })
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    async fn launch(&self, battle_id: BattleId, task: &TaskSpec) -> Result<Box<dyn SandboxInstance>> {
        let command = self.environments.get(&task.environment_id).ok_or_else(|| {
            EngineError::Provisioning(format!("unknown environment '{}'", task.environment_id))
        })?;

        let mut child = self.spawn(battle_id, command)?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Provisioning("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Provisioning("failed to capture stdout".into()))?;

        let mut instance = ProcessInstance {
            instance_ref: format!("{}-{}", task.environment_id, battle_id),
            pid,
            child,
            reader: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            awaiting_reply: false,
            terminate_grace: self.terminate_grace,
        };

        let ready = instance.read_message().await.map_err(into_provisioning)?;
        if ready.get("ready").and_then(Value::as_bool) != Some(true) {
            let _ = instance.terminate().await;
            return Err(EngineError::Provisioning(format!(
                "environment announced {} instead of ready",
                ready
            )));
        }

        let reset = json!({
            "op": "reset",
            "battle_id": battle_id.to_string(),
            "environment": task.environment_id,
            "params": task.params,
        });
        if let Err(e) = instance.request(reset).await {
            let _ = instance.terminate().await;
            return Err(into_provisioning(e));
        }

        info!(battle_id = %battle_id, pid = ?pid, "Environment process ready");
        Ok(Box::new(instance))
    }
}

fn into_provisioning(err: EngineError) -> EngineError {
    match err {
        EngineError::SandboxExecution(msg) => EngineError::Provisioning(msg),
        other => other,
    }
}

/// A running environment process
pub struct ProcessInstance {
    instance_ref: String,
    pid: Option<u32>,
    child: Child,
    reader: FramedRead<ChildStdout, LinesCodec>,
    writer: FramedWrite<ChildStdin, LinesCodec>,

    /// A request was written and its reply not yet consumed
    awaiting_reply: bool,

    terminate_grace: Duration,
}

impl ProcessInstance {
    async fn read_message(&mut self) -> Result<Value> {
        let line = match self.reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                return Err(EngineError::SandboxExecution(format!("read error: {}", e)));
            }
            None => {
                return Err(EngineError::SandboxExecution(
                    "environment closed its output".into(),
                ));
            }
        };

        let message: Value = serde_json::from_str(&line).map_err(|e| {
            EngineError::SandboxExecution(format!("invalid environment message: {}", e))
        })?;

        if let Some(error) = message.get("error") {
            return Err(EngineError::SandboxExecution(match error.as_str() {
                Some(s) => s.to_string(),
                None => error.to_string(),
            }));
        }
        Ok(message)
    }

    async fn request(&mut self, message: Value) -> Result<Value> {
        if self.awaiting_reply {
            return Err(EngineError::SandboxExecution(format!(
                "environment {} is out of sync after an interrupted request",
                self.instance_ref
            )));
        }

        self.awaiting_reply = true;
        self.writer
            .send(message.to_string())
            .await
            .map_err(|e| EngineError::SandboxExecution(format!("write error: {}", e)))?;
        let reply = self.read_message().await;
        self.awaiting_reply = false;
        reply
    }
}

#[async_trait]
impl SandboxInstance for ProcessInstance {
    fn instance_ref(&self) -> &str {
        &self.instance_ref
    }

    async fn observe(&mut self) -> Result<Observation> {
        let mut response = self.request(json!({ "op": "observe" })).await?;
        match response.get_mut("observation") {
            Some(observation) => Ok(observation.take()),
            None => Err(EngineError::SandboxExecution(
                "observe response has no observation".into(),
            )),
        }
    }

    async fn step(&mut self, action: &Action) -> Result<StepOutcome> {
        let response = self.request(json!({ "op": "step", "action": action })).await?;
        serde_json::from_value(response)
            .map_err(|e| EngineError::SandboxExecution(format!("invalid step response: {}", e)))
    }

    async fn exec(&mut self, command: &str) -> Result<String> {
        let response = self.request(json!({ "op": "exec", "command": command })).await?;
        Ok(response
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            // SIGTERM first so containers get a chance to stop cleanly
            debug!(pid, "Sending SIGTERM to environment process");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed; process may have exited");
            }
        }

        match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(instance_ref = %self.instance_ref, %status, "Environment process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Teardown(format!("wait failed: {}", e))),
            Err(_) => {
                warn!(instance_ref = %self.instance_ref, "Environment ignored SIGTERM, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| EngineError::Teardown(format!("kill failed: {}", e)))
            }
        }
    }
}
