//! Sync run lifecycle tracking.

mod run_model;
mod run_traits;

pub use run_model::*;
pub use run_traits::*;
