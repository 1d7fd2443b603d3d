//! # Vigil Core
//!
//! Scan pipeline orchestrator for automated smart-contract audits.
//!
//! A submitted scan becomes a job on a durable queue. Consumers lease jobs,
//! wait for an agent from a bounded pool, and run the seven-stage pipeline
//! (CLONE, COMPILE, DEPLOY, ANALYZE, AI_DEEP_ANALYSIS, PROOF_GENERATION,
//! SUBMIT) with per-stage timeouts and failure policy. Each stage is recorded
//! in a step ledger, progress is published to an event sink, and the
//! ephemeral chain process spawned for DEPLOY is torn down on every exit path.
//!
//! ## Feature Flags
//!
//! - `postgres`: durable queue and repositories on PostgreSQL (SQLx)
//! - `command-executors`: stage executors that run configured commands
//!   speaking JSON over stdin/stdout
//!
//! ## Architecture
//!
//! - [`scan::model`]: persisted records (scan, step record, finding, proof, agent run)
//! - [`scan::orchestration`]: queue, admission, ledger, pipeline, consumer, runtime
//! - [`error`]: the [`ScanError`](error::ScanError) taxonomy and persisted error codes

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error taxonomy and persisted error codes
pub mod error;

/// Scan domain records and orchestration
pub mod scan;

/// Strongly typed identifiers
pub mod types;

#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{ErrorCode, Result, ScanError};
