// src/executor/state.rs
//! Per-battle shared state held in the orchestrator registry

use crate::battle::{Battle, BattleId, BattleStatus, Trajectory};
use crate::utils::errors::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queued diagnostic commands per battle
pub(crate) const COMMAND_QUEUE_DEPTH: usize = 16;

/// Battle record plus its append-only trajectory
#[derive(Debug)]
pub(crate) struct BattleState {
    pub battle: Battle,
    pub trajectory: Trajectory,
}

/// Diagnostic command routed to the battle's run task
pub(crate) struct DiagnosticCommand {
    pub command: String,
    pub reported_by: String,
    pub reply: oneshot::Sender<Result<String>>,
}

/// Everything the orchestrator and the run task share for one battle
pub(crate) struct BattleShared {
    pub id: BattleId,
    pub state: RwLock<BattleState>,
    pub cancel: CancellationToken,
    pub status_tx: watch::Sender<BattleStatus>,
    pub commands: mpsc::Sender<DiagnosticCommand>,
    pub task: Mutex<Option<JoinHandle<()>>>,
}

impl BattleShared {
    pub fn new(battle: Battle, commands: mpsc::Sender<DiagnosticCommand>) -> Self {
        let (status_tx, _) = watch::channel(battle.status);
        Self {
            id: battle.id,
            state: RwLock::new(BattleState {
                battle,
                trajectory: Trajectory::new(),
            }),
            cancel: CancellationToken::new(),
            status_tx,
            commands,
            task: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Battle {
        self.state.read().battle.clone()
    }

    pub fn status(&self) -> BattleStatus {
        self.state.read().battle.status
    }
}
