//! Menu synchronization and versioning engine.
//!
//! Keeps a point-of-sale catalog and a delivery marketplace menu in step:
//! versioned snapshots per scope, field-level deltas, stable remote codes,
//! idempotent runs with a full audit trail, and a dead letter queue for
//! operations that exhausted their retries.

pub mod catalog;
pub mod deltas;
pub mod dlq;
pub mod errors;
pub mod idempotency;
pub mod mappings;
pub mod memory;
pub mod runs;
pub mod scope;
pub mod snapshots;
pub mod sync;
pub mod utils;

pub use errors::{Error, Result};
pub use scope::SyncScope;
pub use sync::{
    RunSyncRequest, SyncDisposition, SyncEngineConfig, SyncEngineStores, SyncOrchestrator,
    SyncReport, SyncTrigger,
};
