//! Redis Counter Store
//!
//! Networked [`CounterStore`] for deployments where several stateless service
//! instances share quota counters and queues. Conditional primitives run as
//! Lua scripts so the check and the mutation are one server-side step.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::fmt;
use std::time::Duration;

use super::error::Result;
use super::store::CounterStore;

const INCREMENT_BELOW: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1]) or "0")
if current >= tonumber(ARGV[1]) then
    return -1
end
local value = redis.call("INCR", KEYS[1])
if value == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return value
"#;

const PUSH_BOUNDED: &str = r#"
local len = redis.call("LLEN", KEYS[1])
if len >= tonumber(ARGV[2]) then
    return -1
end
return redis.call("RPUSH", KEYS[1], ARGV[1])
"#;

const COMPARE_AND_SET: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
    return 1
end
return 0
"#;

/// Redis-backed store
#[derive(Clone)]
pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    increment_below: Script,
    push_bounded: Script,
    compare_and_set: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        tracing::info!("Connected to redis counter store");
        Ok(Self::from_connection_manager(connection_manager))
    }

    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            increment_below: Script::new(INCREMENT_BELOW),
            push_bounded: Script::new(PUSH_BOUNDED),
            compare_and_set: Script::new(COMPARE_AND_SET),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_below(&self, key: &str, ceiling: u64, ttl: Duration) -> Result<Option<u64>> {
        let mut conn = self.conn();
        let value: i64 = self
            .increment_below
            .key(key)
            .arg(ceiling)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok((value >= 0).then_some(value as u64))
    }

    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn push_bounded(&self, list: &str, item: String, max_len: usize) -> Result<Option<usize>> {
        let mut conn = self.conn();
        let len: i64 = self
            .push_bounded
            .key(list)
            .arg(item)
            .arg(max_len)
            .invoke_async(&mut conn)
            .await?;
        Ok((len >= 0).then_some(len as usize))
    }

    async fn pop_front(&self, list: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let item: Option<String> = redis::cmd("LPOP").arg(list).query_async(&mut conn).await?;
        Ok(item)
    }

    async fn remove(&self, list: &str, item: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("LREM")
            .arg(list)
            .arg(1)
            .arg(item)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn items(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn set_value(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
