//! Queue-driven scan orchestration.
//!
//! Control flow for one job: [`JobConsumer`] leases it from the
//! [`QueueService`], waits in the [`AdmissionController`] for an agent, then
//! hands it to the [`PipelineOrchestrator`], which sequences the stage
//! executors while writing the [`StepLedger`] and owning the job's
//! [`ChainScope`].

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod consumer;
pub mod events;
pub mod executors;
pub mod job;
pub mod lease;
pub mod ledger;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod runtime;
pub mod submission;

pub use admission::*;
pub use cleanup::*;
pub use config::*;
pub use consumer::*;
pub use events::*;
pub use executors::*;
pub use job::*;
pub use lease::*;
pub use ledger::*;
pub use persistence::*;
pub use pipeline::*;
pub use queue::*;
pub use runtime::*;
pub use submission::*;
