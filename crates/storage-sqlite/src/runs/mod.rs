mod model;
mod repository;

pub use model::{SyncRunDB, SyncRunStepDB};
pub use repository::SyncRunRepository;
