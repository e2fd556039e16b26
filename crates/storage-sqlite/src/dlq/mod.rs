mod model;
mod repository;

pub use model::DeadLetterDB;
pub use repository::DeadLetterRepository;
