use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub type StoreResult<T> = Result<T, StoreError>;
pub type SharedStore = Arc<dyn Store>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing cannot be reached; callers degrade instead of retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("wrong type for key {0}")]
    WrongType(String),
    #[error("store error: {0}")]
    Other(String),
}

/// Primitive capability shared by the engine. Implementations must keep every
/// operation atomic with respect to concurrent callers of the same key.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<()>;
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn scard(&self, key: &str) -> StoreResult<u64>;

    /// Append to the rotation tail. No-op when the member is already present.
    async fn list_push_back(&self, key: &str, member: &str) -> StoreResult<()>;
    /// Atomically pop the head and re-push it at the tail, returning the
    /// popped member. The key-rotation primitive.
    async fn list_rotate(&self, key: &str) -> StoreResult<Option<String>>;
    async fn list_remove(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn list_len(&self, key: &str) -> StoreResult<u64>;
    async fn list_all(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>>;
    async fn zpop_max(&self, key: &str) -> StoreResult<Option<(String, f64)>>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    /// Subscribe to a channel. The receiver closes when the store shuts down
    /// or (for the shared backing) the connection is lost; subscribers are
    /// expected to re-subscribe.
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>>;
}
