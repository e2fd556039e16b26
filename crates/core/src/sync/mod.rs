//! Sync orchestration: collaborators, configuration and the run state machine.

mod collaborators;
mod config;
mod orchestrator;
mod retry;
mod scheduler;
mod sync_model;

pub use collaborators::*;
pub use config::*;
pub use orchestrator::*;
pub use retry::*;
pub use scheduler::*;
pub use sync_model::*;

#[cfg(test)]
mod tests;
