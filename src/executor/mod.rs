// src/executor/mod.rs
//! Battle execution
//!
//! - **orchestrator**: registry and lifecycle operations (start, status, abort, ...)
//! - **run**: provisioning, step loop, scoring and teardown for one battle
//! - **state**: shared per-battle state
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── Orchestrator ──────────────────────────┐
//! │  DashMap<BattleId, BattleShared>                                 │
//! │        │ spawn                                                   │
//! │        ▼                                                         │
//! │  BattleRun ──► SandboxManager ──► SandboxInstance                │
//! │      │    ──► PeerClient ──────► remote agent                    │
//! │      │    ──► TelemetrySink ───► control plane (best effort)     │
//! │      └────► scoring::score                                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod orchestrator;
mod run;
mod state;

pub use orchestrator::Orchestrator;
