mod model;
mod repository;

pub use model::IdempotencyRecordDB;
pub use repository::IdempotencyRepository;
