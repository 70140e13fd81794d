//! Redis `StateBackend`.
//!
//! Records are hashes with `data`, `ver` and `hb` fields. Conditional writes
//! and the sliding window run as Lua scripts so each call is one atomic step
//! on the server regardless of how many gateways race on the key.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use super::{CasOutcome, StateBackend, VersionedRecord, WindowOutcome, WindowRequest};
use crate::error::StoreError;

const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'ver', 1)
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// -1 missing, 0 stale version, otherwise the new version.
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'ver')
if not current then
  return -1
end
if tonumber(current) ~= tonumber(ARGV[1]) then
  return 0
end
local next = redis.call('HINCRBY', KEYS[1], 'ver', 1)
redis.call('HSET', KEYS[1], 'data', ARGV[2])
return next
"#;

const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'hb', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

// Unit entries are stored as "<units>:<member>" so the sum can be recovered
// from the sorted set alone.
const WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cutoff = now - window
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', cutoff)

local requests = redis.call('ZCARD', KEYS[1])
local units = 0
for _, m in ipairs(redis.call('ZRANGE', KEYS[2], 0, -1)) do
  local sep = string.find(m, ':', 1, true)
  units = units + tonumber(string.sub(m, 1, sep - 1))
end

local oldest = now
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if first[2] then oldest = math.min(oldest, tonumber(first[2])) end
first = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
if first[2] then oldest = math.min(oldest, tonumber(first[2])) end

local request_units = tonumber(ARGV[5])
local weighted = tonumber(ARGV[6])
if requests + request_units > tonumber(ARGV[3]) or units + weighted > tonumber(ARGV[4]) then
  return {0, requests, units, oldest}
end

for i = 1, request_units do
  redis.call('ZADD', KEYS[1], now, ARGV[7] .. ':' .. i)
end
if weighted > 0 then
  redis.call('ZADD', KEYS[2], now, weighted .. ':' .. ARGV[7])
end
redis.call('PEXPIRE', KEYS[1], window + 1000)
redis.call('PEXPIRE', KEYS[2], window + 1000)
return {1, requests + request_units, units + weighted, oldest}
"#;

pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    insert: Script,
    cas: Script,
    touch: Script,
    window: Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis state backend");
        Ok(Self {
            client,
            conn,
            insert: Script::new(INSERT_SCRIPT),
            cas: Script::new(CAS_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            window: Script::new(WINDOW_SCRIPT),
        })
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

#[async_trait]
impl StateBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let (data, version, heartbeat): (Option<String>, Option<u64>, Option<i64>) =
            ::redis::cmd("HMGET")
                .arg(key)
                .arg("data")
                .arg("ver")
                .arg("hb")
                .query_async(&mut conn)
                .await?;
        Ok(match (data, version) {
            (Some(value), Some(version)) => Some(VersionedRecord {
                value,
                version,
                heartbeat_ms: heartbeat,
            }),
            _ => None,
        })
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .insert
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .cas
            .key(key)
            .arg(expected_version)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(match outcome {
            -1 => CasOutcome::Missing,
            0 => CasOutcome::VersionMismatch,
            v => CasOutcome::Applied { version: v as u64 },
        })
    }

    async fn touch(&self, key: &str, ttl: Duration, heartbeat_ms: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let touched: i64 = self
            .touch
            .key(key)
            .arg(millis(ttl))
            .arg(heartbeat_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn flag_exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: i64 = ::redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists == 1)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = ::redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() })
            .boxed())
    }

    async fn sliding_window(&self, request: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .window
            .key(&request.requests_key)
            .key(&request.units_key)
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.max_requests)
            .arg(request.max_units)
            .arg(request.request_units)
            .arg(request.weighted_units)
            .arg(&request.member)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_slice() {
            [allowed, requests, units, oldest] => Ok(WindowOutcome {
                allowed: *allowed == 1,
                request_count: (*requests).max(0) as u64,
                unit_count: (*units).max(0) as u64,
                oldest_ms: *oldest,
            }),
            other => Err(StoreError::Unavailable(format!(
                "unexpected sliding window reply of {} values",
                other.len()
            ))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
