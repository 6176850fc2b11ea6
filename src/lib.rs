// src/lib.rs
//! Battle Engine Library
//!
//! Runs isolated, time-bounded *battles*: a sandboxed task environment is
//! provisioned, a remote peer agent is driven through an observation/action
//! loop against it, and the resulting trajectory is scored.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **battle**: shared data model (battle record, steps, task spec)
//! - **executor**: battle orchestrator and the per-battle run procedure
//! - **runtime**: sandbox admission, lifecycle and the process backend
//! - **peer**: peer agent protocol and HTTP client
//! - **telemetry**: best-effort control-plane reporting
//! - **scoring**: pure trajectory scoring
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration, errors, retry backoff
//!
//! # Example
//!
//! ```no_run
//! use battle_engine::{Budget, EngineConfig, Orchestrator, PeerEndpoint, TaskSpec};
//! use std::time::Duration;
//!
//! # async fn run() -> battle_engine::Result<()> {
//! let orchestrator = Orchestrator::new(EngineConfig::load()?)?;
//!
//! let task = TaskSpec::new("alfworld", 30, 600);
//! let peer = PeerEndpoint::new("http://127.0.0.1:9011/act", Duration::from_secs(30));
//! let id = orchestrator.start(task.clone(), peer, Budget::for_task(&task))?;
//!
//! let battle = orchestrator.wait(id).await?;
//! println!("{} -> {:?}", battle.status, battle.score);
//! # Ok(())
//! # }
//! ```

pub mod battle;
pub mod executor;
pub mod observability;
pub mod peer;
pub mod runtime;
pub mod scoring;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use battle::{
    Battle, BattleId, BattleStatus, Budget, FailureReason, PeerEndpoint, ScoreResult, ScoringRule,
    StepRecord, TaskSpec,
};
pub use executor::Orchestrator;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
