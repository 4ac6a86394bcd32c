//! `vouchsafe-store` — the ledger store contract and its adapters.
//!
//! Components above this crate depend on the [`LedgerStore`] trait only.
//! Two adapters ship here: an in-memory store for tests/dev, and a Redis
//! store (feature `redis`) whose redemption commit runs as a server-side
//! script so the conditional transaction holds across service instances.

pub mod ledger;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use ledger::{CommitOutcome, CommitRequest, LedgerStore, StoreError, UpdateOutcome};
pub use memory::InMemoryLedgerStore;
#[cfg(feature = "redis")]
pub use redis::RedisLedgerStore;
