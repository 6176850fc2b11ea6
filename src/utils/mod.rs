// src/utils/mod.rs
//! Common utilities: configuration, error taxonomy, retry backoff

pub mod backoff;
pub mod config;
pub mod errors;

pub use backoff::{RetryOverrides, RetryPolicy};
pub use config::EngineConfig;
pub use errors::{EngineError, Result};
