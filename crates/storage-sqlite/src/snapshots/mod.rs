mod model;
mod repository;

pub use model::CatalogSnapshotDB;
pub use repository::SnapshotRepository;
