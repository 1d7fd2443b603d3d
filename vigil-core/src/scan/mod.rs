//! Scan domain: persisted records, orchestration and stage executors.

#[cfg(feature = "command-executors")]
pub mod command;
pub mod model;
pub mod orchestration;

pub use model::*;
pub use orchestration::*;
