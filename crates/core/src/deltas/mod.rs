//! Delta generator, delta records and soft-deletion audit.

mod deletion_model;
mod delta_generator;
mod delta_model;
mod delta_traits;

pub use deletion_model::*;
pub use delta_generator::*;
pub use delta_model::*;
pub use delta_traits::*;
