use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

use super::{ttl_seconds, StateStore};
use crate::error::Result;
use crate::observability::{get_metrics, LatencyTimer};

/// Deletes the key only when it still holds the expected value.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Overwrites the key and refreshes its expiry only when it still holds the expected value.
const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    redis.call("set", KEYS[1], ARGV[2], "EX", ARGV[3])
    return 1
else
    return 0
end
"#;

/// Increments the counter; the expiry is only attached on creation.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("incr", KEYS[1])
if count == 1 then
    redis.call("expire", KEYS[1], ARGV[1])
end
return count
"#;

/// Redis-backed [`StateStore`].
///
/// Acquisition uses `SET NX EX`; the conditional mutations run as Lua scripts so
/// the read and the write happen atomically on the server.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
}

impl RedisStateStore {
    /// Opens a multiplexed connection to the server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::from_client(&client).await
    }

    pub async fn from_client(client: &Client) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Round-trips a `PING` to the server.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn observe<T>(operation: &str, timer: LatencyTimer, result: &redis::RedisResult<T>) {
    get_metrics().record_store_operation(operation, timer.elapsed_ms(), result.is_ok());
    if let Err(e) = result {
        tracing::error!(operation, error = %e, "Redis state store operation failed");
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await;
        observe("set_if_absent", timer, &result);

        Ok(result?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        observe("get", timer, &result);

        Ok(result?)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<i64> = Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await;
        observe("compare_and_delete", timer, &result);

        Ok(result? == 1)
    }

    async fn increment_and_maybe_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<i64> = Script::new(INCREMENT_SCRIPT)
            .key(key)
            .arg(ttl_seconds(ttl))
            .invoke_async(&mut conn)
            .await;
        observe("increment_and_maybe_expire", timer, &result);

        Ok(result?)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<i64> = Script::new(COMPARE_AND_SET_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_seconds(ttl))
            .invoke_async(&mut conn)
            .await;
        observe("compare_and_set", timer, &result);

        Ok(result? == 1)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<()> = conn.set_ex(key, value, ttl_seconds(ttl)).await;
        observe("set_with_ttl", timer, &result);

        Ok(result?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<i64> = conn.del(key).await;
        observe("delete", timer, &result);

        Ok(result? > 0)
    }
}
