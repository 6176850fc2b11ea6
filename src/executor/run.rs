// src/executor/run.rs
//! One battle, end to end
//!
//! ```text
//! Provisioning ──(retry w/ backoff)──► Running ──► step loop
//!      │                                              │
//!      │              done / max steps / deadline ────┼──► Scoring ──┐
//!      │              peer timeout / 3 strikes ───────┘              │
//!      │              sandbox failure / abort ─────────────────────┐ │
//!      └── exhausted / no slot / abort ─────────────────────────┐  │ │
//!                                                               ▼  ▼ ▼
//!                                          TearingDown (destroy exactly once)
//!                                                               │
//!                                          Completed | Failed | Aborted
//! ```
//!
//! Abort and the battle deadline are raced against every suspension point.

use crate::battle::{
    Action, BattleId, BattleStatus, Failure, FailureReason, Observation, PeerEndpoint, ScoreResult,
    StepFailureTag, StepOutcome, StepRecord, TaskSpec, TeardownState,
};
use crate::executor::orchestrator::EngineContext;
use crate::executor::state::{BattleShared, BattleState, DiagnosticCommand};
use crate::peer::PeerRequest;
use crate::runtime::SandboxHandle;
use crate::scoring;
use crate::telemetry::Severity;
use crate::utils::errors::EngineError;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Why the battle stopped making progress
#[derive(Debug)]
enum LoopExit {
    Done,
    MaxSteps,
    Deadline,
    Aborted,

    /// Scored, then Failed
    Fault(EngineError),

    /// Failed without scoring
    Unrecoverable(EngineError),
}

/// Terminal decision taken before teardown
struct Conclusion {
    status: BattleStatus,
    failure: Option<Failure>,
}

pub(crate) struct BattleRun {
    ctx: Arc<EngineContext>,
    shared: Arc<BattleShared>,
    endpoint: PeerEndpoint,

    /// Task as scored (carries the effective step budget)
    task: TaskSpec,

    max_steps: u32,
    deadline: Instant,
}

impl BattleRun {
    pub fn new(
        ctx: Arc<EngineContext>,
        shared: Arc<BattleShared>,
        endpoint: PeerEndpoint,
        deadline: Instant,
    ) -> Self {
        let (task, max_steps) = {
            let state = shared.state.read();
            let mut task = state.battle.task.clone();
            task.max_steps = state.battle.max_steps;
            (task, state.battle.max_steps)
        };

        Self {
            ctx,
            shared,
            endpoint,
            task,
            max_steps,
            deadline,
        }
    }

    fn id(&self) -> BattleId {
        self.shared.id
    }

    #[instrument(skip_all, fields(battle_id = %self.shared.id))]
    pub async fn run(self, mut commands: mpsc::Receiver<DiagnosticCommand>) {
        let started = std::time::Instant::now();
        info!(environment = %self.task.environment_id, max_steps = self.max_steps, "Battle run started");

        let mut handle = self.ctx.sandboxes.open(self.id());

        let exit = match self.provision(&mut handle).await {
            Ok(()) => {
                self.transition(BattleStatus::Running);
                self.step_loop(&mut handle, &mut commands).await
            }
            Err(exit) => exit,
        };
        debug!(?exit, "Battle loop finished");

        let conclusion = self.conclude(exit);
        self.teardown(&mut handle).await;
        self.finish(conclusion);

        metrics::histogram!("battle_duration_seconds").record(started.elapsed().as_secs_f64());
    }

    async fn provision(&self, handle: &mut SandboxHandle) -> Result<(), LoopExit> {
        let policy = self.ctx.retry.with_overrides(self.task.retry.as_ref());
        let mut failures = 0u32;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(LoopExit::Aborted),
                _ = sleep_until(self.deadline) => {
                    return Err(LoopExit::Unrecoverable(EngineError::DeadlineExceeded));
                }
                result = self.ctx.sandboxes.provision(handle, &self.task) => result,
            };

            let err = match attempt {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let retriable = matches!(err, EngineError::Provisioning(_));
            if retriable {
                failures += 1;
                self.update(|s| s.battle.retries.provisioning = failures);
            }

            if !retriable || failures >= policy.max_attempts {
                warn!(attempts = failures, error = %err, "Provisioning gave up");
                self.ctx
                    .telemetry
                    .log(self.id(), Severity::Error, format!("provisioning failed: {}", err));
                return Err(LoopExit::Unrecoverable(err));
            }

            let delay = policy.delay_for(failures);
            warn!(
                attempt = failures,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Provisioning failed, retrying"
            );
            self.ctx.telemetry.log(
                self.id(),
                Severity::Warning,
                format!("provisioning attempt {} failed: {}", failures, err),
            );

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(LoopExit::Aborted),
                _ = sleep_until(self.deadline) => {
                    return Err(LoopExit::Unrecoverable(EngineError::DeadlineExceeded));
                }
                _ = sleep(delay) => {}
            }
        }
    }

    async fn step_loop(
        &self,
        handle: &mut SandboxHandle,
        commands: &mut mpsc::Receiver<DiagnosticCommand>,
    ) -> LoopExit {
        let mut observation = match self.observe(handle).await {
            Ok(observation) => observation,
            Err(exit) => return exit,
        };
        let strike_limit = self.ctx.malformed_strike_limit;

        loop {
            if self.shared.cancel.is_cancelled() {
                return LoopExit::Aborted;
            }

            let index = self.shared.state.read().trajectory.next_index();
            if index >= u64::from(self.max_steps) {
                return LoopExit::MaxSteps;
            }

            let now = Instant::now();
            if now >= self.deadline {
                return LoopExit::Deadline;
            }

            let step_deadline = now
                .checked_add(self.endpoint.timeout())
                .map_or(self.deadline, |at| at.min(self.deadline));
            let cut_by_battle_deadline = step_deadline == self.deadline;
            let request = PeerRequest {
                battle_id: self.id(),
                step_index: index,
                observation: observation.clone(),
                deadline_hint_ms: step_deadline.duration_since(now).as_millis() as u64,
            };

            let reply = {
                let exchange = self.ctx.peer.exchange(&self.endpoint, &request, step_deadline);
                tokio::pin!(exchange);

                loop {
                    tokio::select! {
                        biased;
                        _ = self.shared.cancel.cancelled() => return LoopExit::Aborted,
                        result = &mut exchange => break result,
                        _ = sleep_until(step_deadline) => {
                            break Err(EngineError::PeerTimeout {
                                step_index: index,
                                timeout_ms: step_deadline.duration_since(now).as_millis() as u64,
                            });
                        }
                        Some(command) = commands.recv() => self.run_command(handle, command).await,
                    }
                }
            };
            let peer_elapsed_ms = u64::try_from(now.elapsed().as_millis()).unwrap_or(u64::MAX);

            let action = match reply {
                Ok(action) => action,
                Err(EngineError::PeerTimeout { .. }) if cut_by_battle_deadline => {
                    info!(step_index = index, "Battle deadline reached while waiting for peer");
                    return LoopExit::Deadline;
                }
                Err(EngineError::PeerProtocol(reason)) => {
                    let strikes = self.record_malformed(index, &observation, &reason, peer_elapsed_ms);
                    if strikes >= strike_limit {
                        return LoopExit::Fault(EngineError::PeerProtocol(format!(
                            "{} consecutive malformed actions, last: {}",
                            strikes, reason
                        )));
                    }
                    continue;
                }
                Err(e) => {
                    warn!(step_index = index, error = %e, "Peer exchange failed");
                    return LoopExit::Fault(e);
                }
            };

            if Instant::now() >= self.deadline {
                debug!(step_index = index, "Discarding action received after the deadline");
                return LoopExit::Deadline;
            }
            self.update(|s| s.battle.retries.consecutive_malformed = 0);

            let outcome = match self.apply(handle, &action).await {
                Ok(outcome) => outcome,
                Err(exit) => return exit,
            };

            let done = outcome.done;
            self.record_step(StepRecord {
                battle_id: self.id(),
                index,
                observation,
                action,
                reward: outcome.reward,
                done,
                timestamp: Utc::now(),
                peer_elapsed_ms,
                failure_tag: None,
            });
            observation = outcome.observation;

            if done {
                return LoopExit::Done;
            }
        }
    }

    async fn observe(&self, handle: &mut SandboxHandle) -> Result<Observation, LoopExit> {
        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(LoopExit::Aborted),
            _ = sleep_until(self.deadline) => return Err(LoopExit::Deadline),
            result = self.ctx.sandboxes.observe(handle) => result,
        };
        result.map_err(LoopExit::Unrecoverable)
    }

    /// Apply an action, retrying failed sandbox steps up to `step_retries`
    async fn apply(&self, handle: &mut SandboxHandle, action: &Action) -> Result<StepOutcome, LoopExit> {
        let mut failures = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(LoopExit::Aborted),
                _ = sleep_until(self.deadline) => return Err(LoopExit::Deadline),
                result = self.ctx.sandboxes.step(handle, action) => result,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retriable() && handle.is_usable() && failures < self.ctx.step_retries => {
                    failures += 1;
                    self.update(|s| s.battle.retries.sandbox_step += 1);
                    warn!(attempt = failures, error = %e, "Sandbox step failed, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Sandbox step failed");
                    return Err(LoopExit::Unrecoverable(e));
                }
            }
        }
    }

    async fn run_command(&self, handle: &mut SandboxHandle, command: DiagnosticCommand) {
        debug!(command = %command.command, reported_by = %command.reported_by, "Running diagnostic command");
        let result = self.ctx.sandboxes.exec(handle, &command.command).await;

        let output = match &result {
            Ok(output) => output.clone(),
            Err(e) => format!("error: {}", e),
        };
        self.ctx
            .telemetry
            .command(self.id(), command.command.clone(), command.reported_by.clone(), &output);

        let _ = command.reply.send(result);
    }

    fn record_step(&self, record: StepRecord) {
        let appended = {
            let mut state = self.shared.state.write();
            match state.trajectory.push(record.clone()) {
                Ok(()) => {
                    state.battle.steps_taken = state.trajectory.len() as u32;
                    true
                }
                Err(rejected) => {
                    error!(index = rejected.index, "Rejected out-of-order step record");
                    false
                }
            }
        };

        if appended {
            debug!(step_index = record.index, done = record.done, reward = ?record.reward, "Step recorded");
            metrics::counter!("battle_steps_total").increment(1);
            self.ctx.telemetry.step(&record);
        }
    }

    /// Record a no-op step for a malformed action; returns the current strike count
    fn record_malformed(
        &self,
        index: u64,
        observation: &Observation,
        reason: &str,
        peer_elapsed_ms: u64,
    ) -> u32 {
        warn!(step_index = index, reason, "Malformed peer action");
        metrics::counter!("battle_malformed_actions_total").increment(1);

        let strikes = self.update(|s| {
            s.battle.retries.consecutive_malformed += 1;
            s.battle.retries.consecutive_malformed
        });

        self.record_step(StepRecord {
            battle_id: self.id(),
            index,
            observation: observation.clone(),
            action: Value::Null,
            reward: None,
            done: false,
            timestamp: Utc::now(),
            peer_elapsed_ms,
            failure_tag: Some(StepFailureTag::MalformedAction),
        });
        strikes
    }

    fn conclude(&self, exit: LoopExit) -> Conclusion {
        let steps = self.shared.state.read().trajectory.as_slice().to_vec();

        let (status, score, failure) = match exit {
            LoopExit::Done | LoopExit::MaxSteps | LoopExit::Deadline => {
                self.transition(BattleStatus::Scoring);
                let mut score = scoring::score(&steps, &self.task);
                if score.failure_reason == Some(FailureReason::NotDone) {
                    score.failure_reason = match exit {
                        LoopExit::MaxSteps => Some(FailureReason::MaxStepsExhausted),
                        LoopExit::Deadline => Some(FailureReason::DeadlineExceeded),
                        _ => score.failure_reason,
                    };
                }
                (BattleStatus::Completed, score, None)
            }
            LoopExit::Fault(err) => {
                self.transition(BattleStatus::Scoring);
                let reason = err.reason();
                let score = scoring::score_failed(&steps, &self.task, reason);
                (BattleStatus::Failed, score, Some(Failure::new(reason, err.to_string())))
            }
            LoopExit::Unrecoverable(err) => {
                let reason = err.reason();
                let score = scoring::score_failed(&steps, &self.task, reason);
                (BattleStatus::Failed, score, Some(Failure::new(reason, err.to_string())))
            }
            LoopExit::Aborted => {
                let score = scoring::score_failed(&steps, &self.task, FailureReason::Aborted);
                let failure = Failure::new(FailureReason::Aborted, EngineError::Aborted.to_string());
                (BattleStatus::Aborted, score, Some(failure))
            }
        };

        self.publish_score(score);
        Conclusion { status, failure }
    }

    fn publish_score(&self, score: ScoreResult) {
        info!(
            success = score.success,
            steps_taken = score.steps_taken,
            normalized_score = score.normalized_score,
            "Battle scored"
        );
        self.ctx.telemetry.result(self.id(), &score);
        self.update(|s| s.battle.score = Some(score));
    }

    async fn teardown(&self, handle: &mut SandboxHandle) {
        self.transition(BattleStatus::TearingDown);

        let state = match self.ctx.sandboxes.destroy(handle).await {
            Ok(()) => TeardownState::Succeeded,
            Err(e) => {
                self.ctx
                    .telemetry
                    .log(self.id(), Severity::Error, format!("teardown failed: {}", e));
                TeardownState::FailedNeedsCleanup(e.to_string())
            }
        };
        self.update(|s| s.battle.teardown = state);
    }

    fn finish(&self, conclusion: Conclusion) {
        if let Some(failure) = &conclusion.failure {
            info!(reason = %failure.reason, message = %failure.message, "Battle did not complete");
        }
        self.update(|s| s.battle.failure = conclusion.failure);
        self.transition(conclusion.status);
    }

    fn update<R>(&self, f: impl FnOnce(&mut BattleState) -> R) -> R {
        let mut state = self.shared.state.write();
        f(&mut state)
    }

    fn transition(&self, to: BattleStatus) {
        let applied = self.update(|s| {
            let from = s.battle.status;
            s.battle.transition(to).map(|()| from)
        });

        let from = match applied {
            Ok(from) => from,
            Err(e) => {
                error!(error = %e, "Rejected battle transition");
                return;
            }
        };

        self.ctx.telemetry.status(self.id(), from, to);
        self.shared.status_tx.send_replace(to);

        if to.is_terminal() {
            metrics::counter!("battle_terminal_total", "status" => to.as_str()).increment(1);
            info!(status = %to, "Battle finished");
        }
    }
}
