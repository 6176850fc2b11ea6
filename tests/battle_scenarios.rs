// tests/battle_scenarios.rs
//! End-to-end battle scenarios against in-memory sandbox, peer and control plane

use async_trait::async_trait;
use battle_engine::battle::{Action, Observation, StepFailureTag, StepOutcome};
use battle_engine::peer::{PeerClient, PeerRequest};
use battle_engine::runtime::{SandboxBackend, SandboxInstance};
use battle_engine::telemetry::{ControlPlane, EventKind, TelemetryEvent, TelemetrySink};
use battle_engine::{
    BattleId, BattleStatus, Budget, EngineConfig, EngineError, FailureReason, Orchestrator,
    PeerEndpoint, Result, TaskSpec,
};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockBackend {
    /// Launches that fail before one succeeds
    fail_launches: u32,

    /// Step count at which the environment reports done
    done_at: Option<u64>,

    /// Step calls that fail before steps start succeeding
    failing_steps: u32,

    /// Steps never return
    hang_steps: bool,

    launches: AtomicU32,
    successful_launches: AtomicU32,
    step_calls: Arc<AtomicU32>,
    terminations: Arc<AtomicU32>,
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn launch(&self, _battle_id: BattleId, task: &TaskSpec) -> Result<Box<dyn SandboxInstance>> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_launches {
            return Err(EngineError::Provisioning(format!("image pull failed ({})", attempt)));
        }
        self.successful_launches.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockInstance {
            instance_ref: format!("{}-{}", task.environment_id, attempt),
            steps: 0,
            done_at: self.done_at,
            failing_steps: self.failing_steps,
            hang_steps: self.hang_steps,
            step_calls: Arc::clone(&self.step_calls),
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

struct MockInstance {
    instance_ref: String,
    steps: u64,
    done_at: Option<u64>,
    failing_steps: u32,
    hang_steps: bool,
    step_calls: Arc<AtomicU32>,
    terminations: Arc<AtomicU32>,
}

#[async_trait]
impl SandboxInstance for MockInstance {
    fn instance_ref(&self) -> &str {
        &self.instance_ref
    }

    async fn observe(&mut self) -> Result<Observation> {
        Ok(json!("You are in the middle of a room."))
    }

    async fn step(&mut self, _action: &Action) -> Result<StepOutcome> {
        let call = self.step_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_steps {
            std::future::pending::<()>().await;
        }
        if call < self.failing_steps {
            return Err(EngineError::SandboxExecution("environment crashed".into()));
        }
        self.steps += 1;
        let done = self.done_at == Some(self.steps);
        Ok(StepOutcome {
            observation: json!(format!("observation {}", self.steps)),
            reward: Some(if done { 1.0 } else { 0.0 }),
            done,
        })
    }

    async fn exec(&mut self, command: &str) -> Result<String> {
        Ok(format!("ran {}", command))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

enum PeerBehavior {
    /// Always answer with this action
    Act(&'static str),
    /// Never answer
    Silent,
    /// Always answer with an invalid action
    Malformed,
    /// Answer exactly when the exchange deadline passes
    Late,
    /// Think for a while, then answer
    Delayed(Duration, &'static str),
    /// Scripted replies (`None` is malformed), then "look" forever
    Script(Vec<Option<&'static str>>),
}

struct MockPeer {
    behavior: PeerBehavior,
    requests: Mutex<Vec<PeerRequest>>,
}

impl MockPeer {
    fn new(behavior: PeerBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }
}

fn malformed() -> EngineError {
    EngineError::PeerProtocol("action is empty".into())
}

#[async_trait]
impl PeerClient for MockPeer {
    async fn exchange(
        &self,
        _endpoint: &PeerEndpoint,
        request: &PeerRequest,
        deadline: Instant,
    ) -> Result<Action> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        match &self.behavior {
            PeerBehavior::Act(action) => Ok(json!(action)),
            PeerBehavior::Silent => std::future::pending().await,
            PeerBehavior::Malformed => Err(malformed()),
            PeerBehavior::Delayed(delay, action) => {
                tokio::time::sleep(*delay).await;
                Ok(json!(action))
            }
            PeerBehavior::Late => {
                tokio::time::sleep_until(deadline).await;
                Ok(json!("look"))
            }
            PeerBehavior::Script(replies) => match replies.get(call) {
                Some(Some(action)) => Ok(json!(action)),
                Some(None) => Err(malformed()),
                None => Ok(json!("look")),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingPlane {
    unavailable: bool,
    events: Mutex<Vec<TelemetryEvent>>,
}

#[async_trait]
impl ControlPlane for RecordingPlane {
    async fn deliver(&self, event: &TelemetryEvent) -> Result<()> {
        if self.unavailable {
            return Err(EngineError::Telemetry("503 service unavailable".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Orchestrator,
    backend: Arc<MockBackend>,
    peer: Arc<MockPeer>,
    plane: Arc<RecordingPlane>,
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.jitter = false;
    config.retry.initial_backoff_ms = 10;
    config.retry.max_backoff_ms = 100;
    config.telemetry.retry.initial_backoff_ms = 1;
    config.telemetry.retry.max_backoff_ms = 5;
    config
}

fn harness_with(
    backend: MockBackend,
    peer: PeerBehavior,
    plane: RecordingPlane,
    config: EngineConfig,
) -> Harness {
    let backend = Arc::new(backend);
    let peer = Arc::new(MockPeer::new(peer));
    let plane = Arc::new(plane);
    let telemetry = Arc::new(TelemetrySink::new(&config.telemetry, Some(plane.clone() as Arc<dyn ControlPlane>)));

    let orchestrator =
        Orchestrator::with_components(config, backend.clone(), peer.clone(), telemetry).unwrap();

    Harness {
        orchestrator,
        backend,
        peer,
        plane,
    }
}

fn harness(backend: MockBackend, peer: PeerBehavior) -> Harness {
    harness_with(backend, peer, RecordingPlane::default(), config())
}

fn endpoint(timeout: Duration) -> PeerEndpoint {
    PeerEndpoint::new("http://127.0.0.1:9011/act", timeout)
}

fn budget(max_steps: u32, secs: i64) -> Budget {
    Budget::new(max_steps, Utc::now() + ChronoDuration::seconds(secs))
}

fn statuses(battle: &battle_engine::Battle) -> Vec<BattleStatus> {
    let mut path = vec![BattleStatus::Pending];
    path.extend(battle.transitions.iter().map(|t| t.to));
    path
}

async fn wait_for_status(orchestrator: &Orchestrator, id: BattleId, status: BattleStatus) {
    for _ in 0..1000 {
        if orchestrator.status(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("battle {} never reached {}", id, status);
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never happened", what);
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_done_at_step_three_completes() {
    let h = harness(
        MockBackend {
            done_at: Some(3),
            ..Default::default()
        },
        PeerBehavior::Act("look"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(battle.steps_taken, 3);
    assert!(battle.failure.is_none());

    let score = battle.score.clone().unwrap();
    assert!(score.success);
    assert_eq!(score.steps_taken, 3);
    assert_eq!(score.normalized_score, 1.0);

    assert_eq!(
        statuses(&battle),
        vec![
            BattleStatus::Pending,
            BattleStatus::Provisioning,
            BattleStatus::Running,
            BattleStatus::Scoring,
            BattleStatus::TearingDown,
            BattleStatus::Completed,
        ]
    );

    let steps = h.orchestrator.trajectory(id).unwrap();
    let indices: Vec<u64> = steps.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(steps[2].done);
    assert_eq!(steps[0].observation, json!("You are in the middle of a room."));
    assert_eq!(steps[1].observation, json!("observation 1"));

    let requests = h.peer.requests.lock();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.battle_id == id));

    assert_eq!(h.backend.successful_launches.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
    assert_eq!(h.orchestrator.sandbox_stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_step_budget_exhausted_completes_unsuccessfully() {
    let h = harness(MockBackend::default(), PeerBehavior::Act("wait"));

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 10, 600), endpoint(Duration::from_secs(10)), budget(4, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.max_steps, 4);
    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(battle.steps_taken, 4);

    let score = battle.score.clone().unwrap();
    assert!(!score.success);
    assert_eq!(score.failure_reason, Some(FailureReason::MaxStepsExhausted));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    let h = harness(MockBackend::default(), PeerBehavior::Silent);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(2)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Failed);
    assert_eq!(battle.steps_taken, 0);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::PeerTimeout)
    );

    let score = battle.score.clone().unwrap();
    assert!(!score.success);
    assert_eq!(score.steps_taken, 0);
    assert_eq!(score.failure_reason, Some(FailureReason::PeerTimeout));

    assert!(statuses(&battle).contains(&BattleStatus::Scoring));
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_recovers_after_two_failures() {
    let h = harness(
        MockBackend {
            fail_launches: 2,
            done_at: Some(1),
            ..Default::default()
        },
        PeerBehavior::Act("take apple 1"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert!(statuses(&battle).contains(&BattleStatus::Running));
    assert_eq!(battle.retries.provisioning, 2);
    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 3);
    assert_eq!(h.backend.successful_launches.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_exhausted_fails_and_still_tears_down() {
    let h = harness(
        MockBackend {
            fail_launches: u32::MAX,
            ..Default::default()
        },
        PeerBehavior::Act("look"),
    );

    let task = TaskSpec::new("alfworld", 5, 600).with_retry(battle_engine::utils::RetryOverrides {
        max_attempts: Some(2),
        ..Default::default()
    });
    let id = h
        .orchestrator
        .start(task, endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Failed);
    assert_eq!(battle.retries.provisioning, 2);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::Provisioning)
    );
    assert_eq!(
        statuses(&battle),
        vec![
            BattleStatus::Pending,
            BattleStatus::Provisioning,
            BattleStatus::TearingDown,
            BattleStatus::Failed,
        ]
    );
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 2);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
    assert_eq!(h.orchestrator.sandbox_stats().live, 0);
    assert!(h.peer.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_three_malformed_actions_fail_before_budget() {
    let h = harness(MockBackend::default(), PeerBehavior::Malformed);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 10, 600), endpoint(Duration::from_secs(10)), budget(10, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Failed);
    assert_eq!(battle.steps_taken, 3);
    assert_eq!(battle.retries.consecutive_malformed, 3);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::PeerProtocol)
    );

    let steps = h.orchestrator.trajectory(id).unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps
        .iter()
        .all(|s| s.failure_tag == Some(StepFailureTag::MalformedAction) && s.action.is_null()));
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_battle_deadline_ends_battle_within_grace() {
    let h = harness(MockBackend::default(), PeerBehavior::Silent);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 2))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(battle.steps_taken, 0);
    assert!(h.orchestrator.trajectory(id).unwrap().is_empty());

    let score = battle.score.clone().unwrap();
    assert!(!score.success);
    assert_eq!(score.failure_reason, Some(FailureReason::DeadlineExceeded));
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_running() {
    let h = harness(MockBackend::default(), PeerBehavior::Silent);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 600))
        .unwrap();
    wait_for_status(&h.orchestrator, id, BattleStatus::Running).await;

    h.orchestrator.abort(id).unwrap();
    h.orchestrator.abort(id).unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Aborted);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::Aborted)
    );
    assert!(!statuses(&battle).contains(&BattleStatus::Scoring));
    assert_eq!(battle.score.clone().unwrap().failure_reason, Some(FailureReason::Aborted));
    assert_eq!(h.backend.terminations.load(Ordering::SeqCst), 1);

    // aborting again after the fact changes nothing
    h.orchestrator.abort(id).unwrap();
    assert_eq!(h.orchestrator.status(id).unwrap().status, BattleStatus::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_failure_skips_scoring() {
    let h = harness(
        MockBackend {
            failing_steps: u32::MAX,
            ..Default::default()
        },
        PeerBehavior::Act("open drawer 1"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Failed);
    assert_eq!(battle.retries.sandbox_step, 1);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::SandboxExecution)
    );
    assert!(!statuses(&battle).contains(&BattleStatus::Scoring));
    assert_eq!(battle.steps_taken, 0);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_admission_exhausted() {
    let mut config = config();
    config.sandbox.capacity = 1;
    config.sandbox.admission_wait_ms = 100;
    let h = harness_with(
        MockBackend::default(),
        PeerBehavior::Silent,
        RecordingPlane::default(),
        config,
    );

    let first = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 600))
        .unwrap();
    wait_for_status(&h.orchestrator, first, BattleStatus::Running).await;

    let second = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(second).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Failed);
    assert_eq!(
        battle.failure.as_ref().map(|f| f.reason),
        Some(FailureReason::ResourceExhausted)
    );
    assert_eq!(battle.retries.provisioning, 0);
    assert_eq!(h.orchestrator.sandbox_stats().live, 1);

    h.orchestrator.abort(first).unwrap();
    h.orchestrator.wait(first).await.unwrap();
    assert_eq!(h.orchestrator.sandbox_stats().live, 0);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_control_plane_does_not_change_outcome() {
    let h = harness_with(
        MockBackend {
            done_at: Some(3),
            ..Default::default()
        },
        PeerBehavior::Act("look"),
        RecordingPlane {
            unavailable: true,
            ..Default::default()
        },
        config(),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    let score = battle.score.clone().unwrap();
    assert!(score.success);
    assert_eq!(score.steps_taken, 3);

    let stats = h.orchestrator.shutdown().await;
    assert_eq!(stats.delivered, 0);
    assert!(stats.failed > 0);
    assert!(h.plane.events.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_follows_battle_order() {
    let h = harness(
        MockBackend {
            done_at: Some(2),
            ..Default::default()
        },
        PeerBehavior::Act("look"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    h.orchestrator.wait(id).await.unwrap();
    h.orchestrator.shutdown().await;

    let events = h.plane.events.lock();
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let transitions: Vec<BattleStatus> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Status { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(transitions.first(), Some(&BattleStatus::Provisioning));
    assert_eq!(transitions.last(), Some(&BattleStatus::Completed));

    let step_indices: Vec<u64> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Step(step) => Some(step.index),
            _ => None,
        })
        .collect();
    assert_eq!(step_indices, vec![0, 1]);
    assert_eq!(events.iter().filter(|e| e.is_result()).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostic_command_runs_in_sandbox() {
    let h = harness(MockBackend::default(), PeerBehavior::Silent);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 600))
        .unwrap();
    wait_for_status(&h.orchestrator, id, BattleStatus::Running).await;

    let output = h.orchestrator.exec(id, "ls /tmp", "green-agent").await.unwrap();
    assert_eq!(output, "ran ls /tmp");

    h.orchestrator.abort(id).unwrap();
    h.orchestrator.wait(id).await.unwrap();

    let result = h.orchestrator.exec(id, "ls", "green-agent").await;
    assert!(matches!(result, Err(EngineError::SandboxExecution(_))));

    h.orchestrator.shutdown().await;
    let commands: Vec<(String, String, String)> = h
        .plane
        .events
        .lock()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::Command {
                command,
                reported_by,
                output,
            } => Some((command.clone(), reported_by.clone(), output.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        commands,
        vec![(
            "ls /tmp".to_string(),
            "green-agent".to_string(),
            "ran ls /tmp".to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_battles_are_isolated() {
    let h = harness(
        MockBackend {
            done_at: Some(2),
            ..Default::default()
        },
        PeerBehavior::Act("look"),
    );

    let ids: Vec<BattleId> = (0..4)
        .map(|_| {
            h.orchestrator
                .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
                .unwrap()
        })
        .collect();

    for id in &ids {
        let battle = h.orchestrator.wait(*id).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Completed);
        let steps = h.orchestrator.trajectory(*id).unwrap();
        assert!(steps.iter().all(|s| s.battle_id == *id));
        assert_eq!(steps.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1]);
    }

    assert_eq!(h.orchestrator.list().len(), 4);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 4);

    let archived = h.orchestrator.archive(ids[0]).unwrap();
    assert_eq!(archived.status, BattleStatus::Completed);
    assert_eq!(h.orchestrator.list().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_action_arriving_at_deadline_is_discarded() {
    let h = harness(MockBackend::default(), PeerBehavior::Late);

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(300)), budget(5, 2))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(battle.steps_taken, 0);
    assert!(h.orchestrator.trajectory(id).unwrap().is_empty());
    assert_eq!(h.peer.requests.lock().len(), 1);
    assert_eq!(h.backend.step_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        battle.score.clone().unwrap().failure_reason,
        Some(FailureReason::DeadlineExceeded)
    );
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_valid_action_resets_malformed_strikes() {
    let h = harness(
        MockBackend::default(),
        PeerBehavior::Script(vec![None, None, Some("look"), None, None]),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 6, 600), endpoint(Duration::from_secs(10)), budget(6, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    assert!(battle.failure.is_none());
    assert_eq!(battle.steps_taken, 6);
    assert_eq!(battle.retries.consecutive_malformed, 0);
    assert_eq!(
        battle.score.clone().unwrap().failure_reason,
        Some(FailureReason::MaxStepsExhausted)
    );

    let tags: Vec<bool> = h
        .orchestrator
        .trajectory(id)
        .unwrap()
        .iter()
        .map(|s| s.failure_tag == Some(StepFailureTag::MalformedAction))
        .collect();
    assert_eq!(tags, vec![true, true, false, true, true, false]);

    // Malformed steps never reach the sandbox
    assert_eq!(h.backend.step_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_step_recovers_after_one_failure() {
    let h = harness(
        MockBackend {
            failing_steps: 1,
            done_at: Some(2),
            ..Default::default()
        },
        PeerBehavior::Act("go to fridge 1"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Completed);
    assert_eq!(battle.retries.sandbox_step, 1);
    assert_eq!(battle.steps_taken, 2);
    assert!(battle.score.clone().unwrap().success);
    assert_eq!(h.backend.step_calls.load(Ordering::SeqCst), 3);

    let indices: Vec<u64> = h.orchestrator.trajectory(id).unwrap().iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_provisioning_backoff() {
    let mut config = config();
    config.retry.max_attempts = 5;
    config.retry.initial_backoff_ms = 60_000;
    config.retry.max_backoff_ms = 60_000;
    let h = harness_with(
        MockBackend {
            fail_launches: u32::MAX,
            ..Default::default()
        },
        PeerBehavior::Act("look"),
        RecordingPlane::default(),
        config,
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    eventually("first provisioning failure", || {
        h.orchestrator.status(id).unwrap().retries.provisioning == 1
    })
    .await;

    h.orchestrator.abort(id).unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Aborted);
    assert_eq!(
        statuses(&battle),
        vec![
            BattleStatus::Pending,
            BattleStatus::Provisioning,
            BattleStatus::TearingDown,
            BattleStatus::Aborted,
        ]
    );
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.terminations.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
    assert_eq!(h.orchestrator.sandbox_stats().live, 0);
    assert!(h.peer.requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_cancels_in_flight_step() {
    let h = harness(
        MockBackend {
            hang_steps: true,
            ..Default::default()
        },
        PeerBehavior::Act("turn on lamp 1"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    eventually("sandbox step started", || {
        h.backend.step_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    h.orchestrator.abort(id).unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    assert_eq!(battle.status, BattleStatus::Aborted);
    assert_eq!(battle.steps_taken, 0);
    assert!(!statuses(&battle).contains(&BattleStatus::Scoring));
    assert_eq!(h.backend.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.sandbox_stats().destroyed, 1);
    assert_eq!(h.orchestrator.sandbox_stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_latency_is_recorded() {
    let h = harness(
        MockBackend {
            done_at: Some(2),
            ..Default::default()
        },
        PeerBehavior::Delayed(Duration::from_millis(250), "look"),
    );

    let id = h
        .orchestrator
        .start(TaskSpec::new("alfworld", 5, 600), endpoint(Duration::from_secs(10)), budget(5, 600))
        .unwrap();
    let battle = h.orchestrator.wait(id).await.unwrap();

    let steps = h.orchestrator.trajectory(id).unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| (250..260).contains(&s.peer_elapsed_ms)));

    let score = battle.score.clone().unwrap();
    assert_eq!(score.peer_time_ms, steps.iter().map(|s| s.peer_elapsed_ms).sum::<u64>());
}
