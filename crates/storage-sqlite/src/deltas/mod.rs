mod model;
mod repository;

pub use model::{ItemDeletionDB, MenuDeltaDB};
pub use repository::{DeletionRepository, DeltaRepository};
