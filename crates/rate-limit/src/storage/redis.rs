//! Redis-based rate limit storage.
//!
//! Every operation is one Lua script, so each counter update is atomic on its shard.
//! Request quotas use an averaging fixed window; principal limits use the exact
//! windows described on [`RateLimitStorage`].

use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::{FromRedisValue, Script, ScriptInvocation};
use telemetry::metrics::{REDIS_COMMAND_DURATION, Recorder};

use super::redis_pool::{Pool, create_pool};
use super::{CounterResult, RateLimitResult, RateLimitStorage, SATURATION_TTL, StorageError};
use config::RedisConfig;

static REQUEST_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local previous = tonumber(redis.call('GET', KEYS[1]) or '0')
        local current = tonumber(redis.call('GET', KEYS[2]) or '0')
        local weighted = previous * (1 - tonumber(ARGV[1])) + current
        if weighted >= tonumber(ARGV[2]) then
            return 0
        end
        redis.call('INCR', KEYS[2])
        redis.call('EXPIRE', KEYS[2], ARGV[3])
        return 1
        ",
    )
});

static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
        local count = redis.call('ZCARD', KEYS[1])
        if count >= tonumber(ARGV[3]) then
            return {0, count}
        end
        redis.call('ZADD', KEYS[1], now, ARGV[4])
        redis.call('PEXPIRE', KEYS[1], window)
        return {1, count + 1}
        ",
    )
});

static RESERVE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local value = redis.call('INCRBY', KEYS[1], ARGV[1])
        if redis.call('PTTL', KEYS[1]) < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[3])
        end
        if value > tonumber(ARGV[2]) then
            value = redis.call('DECRBY', KEYS[1], ARGV[1])
            return {0, value}
        end
        return {1, value}
        ",
    )
});

static ADJUST: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return 0
        end
        local value = redis.call('INCRBY', KEYS[1], ARGV[1])
        if value < 0 then
            redis.call('SET', KEYS[1], 0, 'KEEPTTL')
            return 0
        end
        return value
        ",
    )
});

static ACQUIRE_SLOT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        if count > tonumber(ARGV[1]) then
            count = redis.call('DECR', KEYS[1])
            return {0, count}
        end
        return {1, count}
        ",
    )
});

static RELEASE_SLOT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local count = redis.call('DECR', KEYS[1])
        if count <= 0 then
            redis.call('DEL', KEYS[1])
            return 0
        end
        return count
        ",
    )
});

static GET_SATURATION: LazyLock<Script> = LazyLock::new(|| Script::new("return redis.call('GET', KEYS[1])"));

static SET_SATURATION: LazyLock<Script> =
    LazyLock::new(|| Script::new("redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])"));

/// Redis-based rate limit storage implementation.
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    response_timeout: Duration,
}

impl RedisStorage {
    /// Create the pool and check the server answers.
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = create_pool(config)
            .map_err(|e| StorageError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to get Redis connection from pool: {e}")))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to ping Redis server: {e}")))?;

        Ok(Self {
            pool,
            key_prefix: config
                .key_prefix
                .clone()
                .unwrap_or_else(|| "tianji:rate_limit:".to_string()),
            response_timeout: config.response_timeout.unwrap_or(Duration::from_secs(1)),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        command: &'static str,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T, StorageError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut recorder = Recorder::new(REDIS_COMMAND_DURATION);
        recorder.push_attribute("tianji.redis.command", command);

        let result = tokio::time::timeout(self.response_timeout, invocation.invoke_async(&mut *conn)).await;

        let status = match &result {
            Ok(Ok(_)) => "success",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };

        recorder.push_attribute("tianji.redis.status", status);
        recorder.record();

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StorageError::Query(format!("{command}: {e}"))),
            Err(_) => Err(StorageError::Connection(format!(
                "{command}: no response within {:?}",
                self.response_timeout
            ))),
        }
    }
}

fn now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

fn counter_result((allowed, value): (i64, i64)) -> CounterResult {
    CounterResult {
        allowed: allowed == 1,
        value: value.max(0) as u64,
    }
}

impl RateLimitStorage for RedisStorage {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        duration: Duration,
    ) -> Result<RateLimitResult, StorageError> {
        let now = now().as_secs();
        let window_size = duration.as_secs().max(1);

        let current_bucket = now / window_size;
        let bucket_percentage = (now % window_size) as f64 / window_size as f64;

        let current_key = self.key(&format!("{key}__{current_bucket}"));
        let previous_key = self.key(&format!("{key}__{}", current_bucket.saturating_sub(1)));

        let mut script = REQUEST_WINDOW.prepare_invoke();

        script
            .key(previous_key)
            .key(current_key)
            .arg(bucket_percentage)
            .arg(limit)
            .arg(window_size * 2);

        let allowed: i64 = self.invoke("request_window", &script).await?;

        if allowed == 1 {
            return Ok(RateLimitResult {
                allowed: true,
                retry_after: None,
            });
        }

        let window_end = (current_bucket + 1) * window_size;

        Ok(RateLimitResult {
            allowed: false,
            retry_after: Some(Duration::from_secs(window_end - now)),
        })
    }

    async fn record_event(&self, key: &str, limit: u64, window: Duration) -> Result<CounterResult, StorageError> {
        let now = now().as_millis() as u64;
        let member = format!("{now}-{}", uuid::Uuid::new_v4());

        let mut script = SLIDING_WINDOW.prepare_invoke();

        script
            .key(self.key(key))
            .arg(now)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member);

        self.invoke("sliding_window", &script).await.map(counter_result)
    }

    async fn reserve(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        window: Duration,
    ) -> Result<CounterResult, StorageError> {
        let mut script = RESERVE.prepare_invoke();

        script
            .key(self.key(key))
            .arg(amount)
            .arg(limit)
            .arg(window.as_millis() as u64);

        self.invoke("reserve", &script).await.map(counter_result)
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<u64, StorageError> {
        let mut script = ADJUST.prepare_invoke();
        script.key(self.key(key)).arg(delta);

        let value: i64 = self.invoke("adjust", &script).await?;

        Ok(value.max(0) as u64)
    }

    async fn acquire_slot(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterResult, StorageError> {
        let mut script = ACQUIRE_SLOT.prepare_invoke();

        script
            .key(self.key(key))
            .arg(limit)
            .arg(ttl.as_millis() as u64);

        self.invoke("acquire_slot", &script).await.map(counter_result)
    }

    async fn release_slot(&self, key: &str) -> Result<u64, StorageError> {
        let mut script = RELEASE_SLOT.prepare_invoke();
        script.key(self.key(key));

        let value: i64 = self.invoke("release_slot", &script).await?;

        Ok(value.max(0) as u64)
    }

    async fn saturation(&self, key: &str) -> Result<Option<f64>, StorageError> {
        let mut script = GET_SATURATION.prepare_invoke();
        script.key(self.key(key));

        let value: Option<String> = self.invoke("get_saturation", &script).await?;

        match value {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| StorageError::Query(format!("Invalid saturation value: {value}"))),
            None => Ok(None),
        }
    }

    async fn set_saturation(&self, key: &str, value: f64) -> Result<(), StorageError> {
        let mut script = SET_SATURATION.prepare_invoke();

        script
            .key(self.key(key))
            .arg(value.to_string())
            .arg(SATURATION_TTL.as_secs());

        self.invoke("set_saturation", &script).await
    }
}
