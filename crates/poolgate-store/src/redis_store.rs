use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;

use crate::store::{Store, StoreError, StoreResult};

/// Shared [`Store`] backing. One multiplexed connection serves all commands;
/// subscriptions get their own pub/sub connection because redis dedicates a
/// connection to subscriber mode.
pub struct RedisStore {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self { client, connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        return StoreError::Unavailable(err.to_string());
    }
    if err.kind() == redis::ErrorKind::UnexpectedReturnType {
        return StoreError::WrongType(err.to_string());
    }
    if let Some(code) = err.code()
        && code == "WRONGTYPE"
    {
        return StoreError::WrongType(err.to_string());
    }
    StoreError::Other(err.to_string())
}

async fn query<T: redis::FromRedisValue>(
    mut conn: MultiplexedConnection,
    cmd: redis::Cmd,
) -> StoreResult<T> {
    cmd.query_async(&mut conn).await.map_err(map_redis_error)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        query(self.conn(), cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        query::<()>(self.conn(), cmd).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        query::<()>(self.conn(), cmd).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        query(self.conn(), cmd).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        let added: i64 = query(self.conn(), cmd).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        let removed: i64 = query(self.conn(), cmd).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let mut members: Vec<String> = query(self.conn(), cmd).await?;
        members.sort();
        Ok(members)
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        query(self.conn(), cmd).await
    }

    async fn list_push_back(&self, key: &str, member: &str) -> StoreResult<()> {
        // LREM + RPUSH inside MULTI keeps the push idempotent without a
        // read-check race.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(member)
            .ignore()
            .cmd("RPUSH")
            .arg(key)
            .arg(member)
            .ignore();
        let mut conn = self.conn();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn list_rotate(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("LMOVE");
        cmd.arg(key).arg(key).arg("LEFT").arg("RIGHT");
        query(self.conn(), cmd).await
    }

    async fn list_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(key).arg(0).arg(member);
        let removed: i64 = query(self.conn(), cmd).await?;
        Ok(removed > 0)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        query(self.conn(), cmd).await
    }

    async fn list_all(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(-1);
        query(self.conn(), cmd).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        query(self.conn(), cmd).await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        query(self.conn(), cmd).await
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        query::<()>(self.conn(), cmd).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        query(self.conn(), cmd).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        query::<()>(self.conn(), cmd).await
    }

    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut cmd = redis::cmd("ZPOPMIN");
        cmd.arg(key);
        let popped: Vec<(String, f64)> = query(self.conn(), cmd).await?;
        Ok(popped.into_iter().next())
    }

    async fn zpop_max(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut cmd = redis::cmd("ZPOPMAX");
        cmd.arg(key);
        let popped: Vec<(String, f64)> = query(self.conn(), cmd).await?;
        Ok(popped.into_iter().next())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min).arg(max);
        query(self.conn(), cmd).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        query::<()>(self.conn(), cmd).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;
        pubsub.subscribe(channel).await.map_err(map_redis_error)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let Ok(payload) = message.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
