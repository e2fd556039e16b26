//! SQLite persistence for the menu synchronization engine.
//!
//! Reads go through the r2d2 pool; every write is funnelled through the
//! single writer actor so that version checks and compare-and-set updates
//! run inside one immediate transaction.

pub mod conversions;
pub mod db;
pub mod deltas;
pub mod dlq;
pub mod errors;
pub mod idempotency;
pub mod mappings;
pub mod runs;
pub mod schema;
pub mod snapshots;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use menusync_core::errors::Result;
use menusync_core::SyncEngineStores;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::StorageError;

/// Builds the engine's repository set on top of one pool and writer.
pub fn sqlite_stores(pool: Arc<DbPool>, writer: WriteHandle) -> SyncEngineStores {
    SyncEngineStores {
        snapshots: Arc::new(snapshots::SnapshotRepository::new(pool.clone(), writer.clone())),
        mappings: Arc::new(mappings::MappingRepository::new(pool.clone(), writer.clone())),
        deltas: Arc::new(deltas::DeltaRepository::new(pool.clone(), writer.clone())),
        deletions: Arc::new(deltas::DeletionRepository::new(pool.clone(), writer.clone())),
        runs: Arc::new(runs::SyncRunRepository::new(pool.clone(), writer.clone())),
        idempotency: Arc::new(idempotency::IdempotencyRepository::new(
            pool.clone(),
            writer.clone(),
        )),
        dead_letters: Arc::new(dlq::DeadLetterRepository::new(pool, writer)),
    }
}

/// Opens (creating if needed) the database under `app_data_dir`, applies
/// pending migrations and starts the writer.
pub fn open_stores(app_data_dir: &str) -> Result<SyncEngineStores> {
    let db_path = init(app_data_dir)?;
    run_migrations(&db_path)?;
    let pool = create_pool(&db_path)?;
    let writer = spawn_writer(pool.as_ref().clone());
    Ok(sqlite_stores(pool, writer))
}
