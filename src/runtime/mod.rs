// src/runtime/mod.rs
//! Sandbox runtime
//!
//! This module provides the isolated execution environments battles run in:
//!
//! - **Sandbox Manager**: per-battle handle lifecycle, timeouts, idempotent destroy
//! - **Admission**: process-wide bound on live sandbox instances
//! - **Backend**: pluggable instance launcher traits
//! - **Process Manager**: environment processes speaking line-delimited JSON
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  SandboxManager                      │
//! │   AdmissionPool (N slots) ── bounded wait ──┐        │
//! │                                             ▼        │
//! │   SandboxHandle(battle A)   SandboxHandle(battle B)  │
//! │          │                          │                │
//! │          ▼                          ▼                │
//! │   SandboxInstance            SandboxInstance         │
//! │   (env process)              (env process)           │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod backend;
pub mod process_manager;
pub mod sandbox;

// Re-export commonly used types
pub use admission::{AdmissionPermit, AdmissionPool};
pub use backend::{SandboxBackend, SandboxInstance};
pub use process_manager::{EnvironmentCommand, ProcessBackend};
pub use sandbox::{SandboxConfig, SandboxHandle, SandboxManager, SandboxStats, SandboxStatus};
