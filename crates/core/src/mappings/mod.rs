//! Stable ID mapper: upstream ids to deterministic downstream remote codes.

mod mapping_model;
mod mapping_service;
mod mapping_traits;
mod remote_code;

pub use mapping_model::*;
pub use mapping_service::*;
pub use mapping_traits::*;
pub use remote_code::*;
