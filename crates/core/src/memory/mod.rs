//! In-process repository implementations.
//!
//! They honour the same contracts as the SQLite repositories (optimistic
//! snapshot versions, compare-and-set idempotency records, append-only run
//! steps) and back the engine in tests and embedded setups.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{Error, Result};

mod catalog_store;
mod run_store;

pub use catalog_store::*;
pub use run_store::*;

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::internal("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::internal("in-memory store lock poisoned"))
}
