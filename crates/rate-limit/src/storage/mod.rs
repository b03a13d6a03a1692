//! Storage backends for rate limiting.

use std::time::Duration;

use config::StorageConfig;

pub mod memory;
pub mod redis;
pub mod redis_pool;

pub use self::memory::InMemoryStorage;
pub use self::redis::RedisStorage;

/// Result type for rate limit checks.
pub struct RateLimitResult {
    /// Whether the request is allowed.
    pub allowed: bool,
    /// Time to wait before retrying if not allowed.
    pub retry_after: Option<Duration>,
}

/// Outcome of an atomic counter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    /// Whether the operation was admitted.
    pub allowed: bool,
    /// Counter value after the operation. Rejected operations leave the counter unchanged.
    pub value: u64,
}

/// Trait for rate limit storage backends.
///
/// Every method is a single atomic step: a Lua script in Redis, a critical section in memory.
#[allow(async_fn_in_trait)]
pub trait RateLimitStorage: Send + Sync {
    /// Check and potentially consume a token for the given key.
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        duration: Duration,
    ) -> Result<RateLimitResult, StorageError>;

    /// Sliding window: drop events older than `window`, reject when `limit` events
    /// remain, otherwise record a new event.
    async fn record_event(&self, key: &str, limit: u64, window: Duration) -> Result<CounterResult, StorageError>;

    /// Add `amount` to a windowed counter, starting the window on first increment.
    /// Rejects and undoes the increment when the result exceeds `limit`.
    async fn reserve(&self, key: &str, amount: u64, limit: u64, window: Duration)
    -> Result<CounterResult, StorageError>;

    /// Add a signed correction to a windowed counter. Expired windows are left alone;
    /// the counter never drops below zero.
    async fn adjust(&self, key: &str, delta: i64) -> Result<u64, StorageError>;

    /// Increment a slot counter with a safety TTL. Rejects and undoes the increment
    /// when the result exceeds `limit`.
    async fn acquire_slot(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterResult, StorageError>;

    /// Decrement a slot counter, never below zero.
    async fn release_slot(&self, key: &str) -> Result<u64, StorageError>;

    /// Read a saturation value.
    async fn saturation(&self, key: &str) -> Result<Option<f64>, StorageError>;

    /// Write a saturation value.
    async fn set_saturation(&self, key: &str, value: f64) -> Result<(), StorageError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Internal storage error.
    #[error("Storage error: {0}")]
    Internal(String),
    /// Could not reach the backend.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The backend rejected a command or returned something unexpected.
    #[error("Query error: {0}")]
    Query(String),
}

/// The coordinating store shared by every limiter of the process.
pub enum Storage {
    /// Per-instance counters.
    Memory(InMemoryStorage),
    /// Counters shared by every instance through Redis.
    Redis(RedisStorage),
}

impl Storage {
    /// Create the backend described by the configuration.
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        match config {
            StorageConfig::Memory => Ok(Storage::Memory(InMemoryStorage::new())),
            StorageConfig::Redis(redis_config) => Ok(Storage::Redis(RedisStorage::new(redis_config).await?)),
        }
    }

    pub(crate) async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        duration: Duration,
    ) -> Result<RateLimitResult, StorageError> {
        match self {
            Storage::Memory(storage) => storage.check_and_consume(key, limit, duration).await,
            Storage::Redis(storage) => storage.check_and_consume(key, limit, duration).await,
        }
    }

    pub(crate) async fn record_event(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<CounterResult, StorageError> {
        match self {
            Storage::Memory(storage) => storage.record_event(key, limit, window).await,
            Storage::Redis(storage) => storage.record_event(key, limit, window).await,
        }
    }

    pub(crate) async fn reserve(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        window: Duration,
    ) -> Result<CounterResult, StorageError> {
        match self {
            Storage::Memory(storage) => storage.reserve(key, amount, limit, window).await,
            Storage::Redis(storage) => storage.reserve(key, amount, limit, window).await,
        }
    }

    pub(crate) async fn adjust(&self, key: &str, delta: i64) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.adjust(key, delta).await,
            Storage::Redis(storage) => storage.adjust(key, delta).await,
        }
    }

    pub(crate) async fn acquire_slot(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterResult, StorageError> {
        match self {
            Storage::Memory(storage) => storage.acquire_slot(key, limit, ttl).await,
            Storage::Redis(storage) => storage.acquire_slot(key, limit, ttl).await,
        }
    }

    pub(crate) async fn release_slot(&self, key: &str) -> Result<u64, StorageError> {
        match self {
            Storage::Memory(storage) => storage.release_slot(key).await,
            Storage::Redis(storage) => storage.release_slot(key).await,
        }
    }

    /// Saturation of a model group, falling back to the process-wide value.
    pub async fn saturation(&self, group: &str) -> Result<f64, StorageError> {
        let group_value = self.read_saturation(&saturation_group_key(group)).await?;

        match group_value {
            Some(value) => Ok(value),
            None => Ok(self.read_saturation(SATURATION_GLOBAL_KEY).await?.unwrap_or(0.0)),
        }
    }

    /// Store the saturation of a model group and of the whole fleet.
    pub async fn set_saturation(&self, group: &str, group_value: f64, global_value: f64) -> Result<(), StorageError> {
        self.write_saturation(&saturation_group_key(group), group_value).await?;
        self.write_saturation(SATURATION_GLOBAL_KEY, global_value).await
    }

    async fn read_saturation(&self, key: &str) -> Result<Option<f64>, StorageError> {
        match self {
            Storage::Memory(storage) => storage.saturation(key).await,
            Storage::Redis(storage) => storage.saturation(key).await,
        }
    }

    async fn write_saturation(&self, key: &str, value: f64) -> Result<(), StorageError> {
        let value = value.clamp(0.0, 1.0);

        match self {
            Storage::Memory(storage) => storage.set_saturation(key, value).await,
            Storage::Redis(storage) => storage.set_saturation(key, value).await,
        }
    }
}

const SATURATION_GLOBAL_KEY: &str = "saturation:global";

/// Published saturation values expire when no instance refreshes them.
pub(crate) const SATURATION_TTL: Duration = Duration::from_secs(120);

fn saturation_group_key(group: &str) -> String {
    format!("saturation:group:{group}")
}
