mod model;
mod repository;

pub use model::ItemMappingDB;
pub use repository::MappingRepository;
