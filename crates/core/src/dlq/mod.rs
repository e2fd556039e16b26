//! Dead letter queue for terminal failures.

mod dlq_model;
mod dlq_service;
mod dlq_traits;

pub use dlq_model::*;
pub use dlq_service::*;
pub use dlq_traits::*;
