//! Process-level runtime for the scan orchestrator: consumer loops, lease
//! housekeeping and the in-process event bus.

mod event_bus;
mod supervisor;

pub use event_bus::*;
pub use supervisor::*;
