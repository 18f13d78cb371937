//! Shared key/value capability used by the request-path engine.
//!
//! Everything that must survive a process restart or be visible to peer
//! instances (key rotation order, failure counters, health samples, cache
//! invalidation fan-out) goes through the [`Store`] trait. Two backings
//! exist: [`MemoryStore`] for single-instance deployments and [`RedisStore`]
//! when several instances share state. Callers depend only on the trait.

mod memory;
mod redis_store;
mod store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{SharedStore, Store, StoreError, StoreResult};
