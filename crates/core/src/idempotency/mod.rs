//! Idempotency guard: keyed lock/ledger with stale-lease reclaim.

mod idempotency_guard;
mod idempotency_model;
mod idempotency_traits;

pub use idempotency_guard::*;
pub use idempotency_model::*;
pub use idempotency_traits::*;
