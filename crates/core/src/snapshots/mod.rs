//! Snapshot store and change detector.

mod change_detector;
mod snapshot_model;
mod snapshot_traits;

pub use change_detector::*;
pub use snapshot_model::*;
pub use snapshot_traits::*;
