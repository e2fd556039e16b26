//! Catalog models, canonical hashing and payload encoding.

mod canonical;
mod catalog_model;
mod codec;

pub use canonical::*;
pub use catalog_model::*;
pub use codec::*;
