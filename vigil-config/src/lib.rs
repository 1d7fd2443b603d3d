//! Configuration loading for the Vigil scan worker.
//!
//! A single [`WorkerConfig`] is resolved at startup from `.env`, a config
//! file or inline JSON, and environment overrides. The resolved value is
//! immutable and threaded into the orchestrator.

pub mod error;
pub mod util;
pub mod worker;

pub use error::ConfigLoadError;
pub use worker::{DatabaseConfig, WorkerConfig, WorkerConfigSource};
