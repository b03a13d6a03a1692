//! In-memory rate limit storage.
//!
//! Request quotas use the governor crate. Sliding windows, token counters and slots are
//! kept in sharded maps, where the shard lock of an entry is the critical section.
//! Idle entries are swept every few thousand operations.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use mini_moka::sync::Cache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CounterResult, RateLimitResult, RateLimitStorage, SATURATION_TTL, StorageError};

type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

const SWEEP_EVERY: u64 = 4096;

struct SlidingWindow {
    events: VecDeque<Instant>,
    window: Duration,
}

impl SlidingWindow {
    fn trim(&mut self, now: Instant) {
        while self
            .events
            .front()
            .is_some_and(|event| now.saturating_duration_since(*event) >= self.window)
        {
            self.events.pop_front();
        }
    }
}

struct WindowedCounter {
    value: u64,
    expires_at: Instant,
}

struct ExpiringValue {
    value: f64,
    expires_at: Instant,
}

/// In-memory rate limit storage implementation.
pub struct InMemoryStorage {
    /// Cache of rate limiters by quota configuration.
    limiters: Cache<String, Arc<KeyedRateLimiter>>,
    /// Lock to prevent thundering herd when creating rate limiters.
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Event timestamps per sliding window key.
    windows: DashMap<String, SlidingWindow>,
    /// Fixed window counters started on first increment.
    counters: DashMap<String, WindowedCounter>,
    /// Parallel request slots.
    slots: DashMap<String, WindowedCounter>,
    /// Saturation values, dropped when not refreshed.
    saturation: DashMap<String, ExpiringValue>,
    /// Operations since the last sweep.
    operations: AtomicU64,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance.
    pub fn new() -> Self {
        let limiters = Cache::builder()
            .max_capacity(10000)
            .time_to_idle(Duration::from_secs(3600))
            .build();

        Self {
            limiters,
            creation_locks: DashMap::new(),
            windows: DashMap::new(),
            counters: DashMap::new(),
            slots: DashMap::new(),
            saturation: DashMap::new(),
            operations: AtomicU64::new(0),
        }
    }

    /// Drop empty windows, expired counters, idle slots and stale saturation values.
    pub fn sweep(&self) {
        let now = Instant::now();

        self.windows.retain(|_, window| {
            window.trim(now);
            !window.events.is_empty()
        });

        self.counters.retain(|_, counter| counter.expires_at > now);
        self.slots.retain(|_, slot| slot.value > 0 && slot.expires_at > now);
        self.saturation.retain(|_, saturation| saturation.expires_at > now);
    }

    // Must run before any entry of the maps is held by the caller.
    fn maybe_sweep(&self) {
        if self.operations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            log::debug!("Sweeping idle in-memory rate limit entries");
            self.sweep();
        }
    }

    async fn limiter(&self, limit: u32, interval: Duration) -> Result<Arc<KeyedRateLimiter>, StorageError> {
        // Limiters are shared by configuration; governor tracks each key separately inside.
        let cache_key = format!("{limit}-{}ms", interval.as_millis());

        if let Some(limiter) = self.limiters.get(&cache_key) {
            return Ok(limiter);
        }

        let creation_lock = self
            .creation_locks
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = creation_lock.lock().await;

        if let Some(limiter) = self.limiters.get(&cache_key) {
            drop(guard);
            self.creation_locks.remove(&cache_key);

            return Ok(limiter);
        }

        let limiter = Arc::new(RateLimiter::keyed(quota_from_config(limit, interval)?));
        self.limiters.insert(cache_key.clone(), limiter.clone());

        log::debug!("Created new rate limiter instance for configuration: {cache_key}");

        drop(guard);
        self.creation_locks.remove(&cache_key);

        Ok(limiter)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStorage for InMemoryStorage {
    async fn check_and_consume(
        &self,
        key: &str,
        limit: u32,
        interval: Duration,
    ) -> Result<RateLimitResult, StorageError> {
        log::debug!("Checking rate limit for key '{key}': {limit} requests allowed per {interval:?}");

        let limiter = self.limiter(limit, interval).await?;

        match limiter.check_key(&key.to_string()) {
            Ok(_) => Ok(RateLimitResult {
                allowed: true,
                retry_after: None,
            }),
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                log::debug!("Request blocked for key '{key}' - rate limit exceeded, retry after {retry_after:?}");

                Ok(RateLimitResult {
                    allowed: false,
                    retry_after: Some(retry_after),
                })
            }
        }
    }

    async fn record_event(&self, key: &str, limit: u64, window: Duration) -> Result<CounterResult, StorageError> {
        self.maybe_sweep();

        let now = Instant::now();

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| SlidingWindow {
            events: VecDeque::new(),
            window,
        });

        entry.window = window;
        entry.trim(now);

        let count = entry.events.len() as u64;

        if count >= limit {
            return Ok(CounterResult {
                allowed: false,
                value: count,
            });
        }

        entry.events.push_back(now);

        Ok(CounterResult {
            allowed: true,
            value: count + 1,
        })
    }

    async fn reserve(
        &self,
        key: &str,
        amount: u64,
        limit: u64,
        window: Duration,
    ) -> Result<CounterResult, StorageError> {
        self.maybe_sweep();

        let now = Instant::now();

        let mut counter = self.counters.entry(key.to_string()).or_insert_with(|| WindowedCounter {
            value: 0,
            expires_at: now + window,
        });

        if counter.expires_at <= now {
            counter.value = 0;
            counter.expires_at = now + window;
        }

        let value = counter.value.saturating_add(amount);

        if value > limit {
            return Ok(CounterResult {
                allowed: false,
                value: counter.value,
            });
        }

        counter.value = value;

        Ok(CounterResult { allowed: true, value })
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<u64, StorageError> {
        let now = Instant::now();

        let Some(mut counter) = self.counters.get_mut(key) else {
            return Ok(0);
        };

        if counter.expires_at <= now {
            return Ok(0);
        }

        counter.value = counter.value.saturating_add_signed(delta);

        Ok(counter.value)
    }

    async fn acquire_slot(&self, key: &str, limit: u64, ttl: Duration) -> Result<CounterResult, StorageError> {
        self.maybe_sweep();

        let now = Instant::now();

        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| WindowedCounter {
            value: 0,
            expires_at: now + ttl,
        });

        if slot.expires_at <= now {
            slot.value = 0;
        }

        slot.expires_at = now + ttl;

        if slot.value + 1 > limit {
            return Ok(CounterResult {
                allowed: false,
                value: slot.value,
            });
        }

        slot.value += 1;

        Ok(CounterResult {
            allowed: true,
            value: slot.value,
        })
    }

    async fn release_slot(&self, key: &str) -> Result<u64, StorageError> {
        let value = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                return Ok(0);
            };

            slot.value = slot.value.saturating_sub(1);
            slot.value
        };

        if value == 0 {
            self.slots.remove_if(key, |_, slot| slot.value == 0);
        }

        Ok(value)
    }

    async fn saturation(&self, key: &str) -> Result<Option<f64>, StorageError> {
        let now = Instant::now();

        let value = self
            .saturation
            .get(key)
            .filter(|saturation| saturation.expires_at > now)
            .map(|saturation| saturation.value);

        if value.is_none() {
            self.saturation.remove_if(key, |_, saturation| saturation.expires_at <= now);
        }

        Ok(value)
    }

    async fn set_saturation(&self, key: &str, value: f64) -> Result<(), StorageError> {
        let expires_at = Instant::now() + SATURATION_TTL;
        self.saturation.insert(key.to_string(), ExpiringValue { value, expires_at });

        Ok(())
    }
}

/// Creates a governor quota for request-based rate limiting.
///
/// The limit is converted to a per-second refill rate, with a burst of 10% of the limit
/// (at least 5, at most the limit). For 100 requests per minute this allows 10 rapid
/// requests, then roughly 1.67 per second.
fn quota_from_config(limit: u32, interval: Duration) -> Result<Quota, StorageError> {
    let per_second = (limit as f64 / interval.as_secs_f64()).max(1.0) as u32;
    let burst = (limit / 10).max(5).min(limit);

    let per_second = per_second
        .try_into()
        .map_err(|_| StorageError::Internal(format!("Invalid per-second rate: {per_second}")))?;

    let burst = burst
        .try_into()
        .map_err(|_| StorageError::Internal(format!("Invalid burst size: {burst}")))?;

    Ok(Quota::per_second(per_second).allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn sliding_window_admits_up_to_limit() {
        let storage = InMemoryStorage::new();

        for expected in 1..=3 {
            let result = storage.record_event("rpm:a", 3, MINUTE).await.unwrap();
            assert_eq!(result, CounterResult { allowed: true, value: expected });
        }

        let result = storage.record_event("rpm:a", 3, MINUTE).await.unwrap();
        assert_eq!(result, CounterResult { allowed: false, value: 3 });

        // other principals are independent
        assert!(storage.record_event("rpm:b", 3, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_slides() {
        let storage = InMemoryStorage::new();

        storage.record_event("rpm:a", 2, MINUTE).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        storage.record_event("rpm:a", 2, MINUTE).await.unwrap();

        assert!(!storage.record_event("rpm:a", 2, MINUTE).await.unwrap().allowed);

        // the first event leaves the window, the second stays
        tokio::time::advance(Duration::from_secs(31)).await;

        let result = storage.record_event("rpm:a", 2, MINUTE).await.unwrap();
        assert_eq!(result, CounterResult { allowed: true, value: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_rejects_over_limit_and_undoes() {
        let storage = InMemoryStorage::new();

        let first = storage.reserve("tpm:a:gpt", 600, 1000, MINUTE).await.unwrap();
        assert_eq!(first, CounterResult { allowed: true, value: 600 });

        let second = storage.reserve("tpm:a:gpt", 500, 1000, MINUTE).await.unwrap();
        assert_eq!(second, CounterResult { allowed: false, value: 600 });

        let third = storage.reserve("tpm:a:gpt", 400, 1000, MINUTE).await.unwrap();
        assert_eq!(third, CounterResult { allowed: true, value: 1000 });
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_window_expires() {
        let storage = InMemoryStorage::new();

        storage.reserve("tpm:a:gpt", 1000, 1000, MINUTE).await.unwrap();
        tokio::time::advance(MINUTE).await;

        let result = storage.reserve("tpm:a:gpt", 10, 1000, MINUTE).await.unwrap();
        assert_eq!(result, CounterResult { allowed: true, value: 10 });
    }

    #[tokio::test(start_paused = true)]
    async fn adjustment_is_bounded_at_zero() {
        let storage = InMemoryStorage::new();

        storage.reserve("tpm:a:gpt", 100, 1000, MINUTE).await.unwrap();

        assert_eq!(storage.adjust("tpm:a:gpt", 50).await.unwrap(), 150);
        assert_eq!(storage.adjust("tpm:a:gpt", -500).await.unwrap(), 0);
        assert_eq!(storage.adjust("tpm:missing", 10).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_are_released() {
        let storage = InMemoryStorage::new();

        assert!(storage.acquire_slot("parallel:a", 1, MINUTE).await.unwrap().allowed);
        assert!(!storage.acquire_slot("parallel:a", 1, MINUTE).await.unwrap().allowed);

        assert_eq!(storage.release_slot("parallel:a").await.unwrap(), 0);
        assert_eq!(storage.release_slot("parallel:a").await.unwrap(), 0);

        assert!(storage.acquire_slot("parallel:a", 1, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_slots_expire() {
        let storage = InMemoryStorage::new();

        assert!(storage.acquire_slot("parallel:a", 1, MINUTE).await.unwrap().allowed);
        tokio::time::advance(MINUTE).await;

        assert!(storage.acquire_slot("parallel:a", 1, MINUTE).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn released_slots_are_removed() {
        let storage = InMemoryStorage::new();

        storage.acquire_slot("parallel:a", 2, MINUTE).await.unwrap();
        storage.acquire_slot("parallel:a", 2, MINUTE).await.unwrap();

        assert_eq!(storage.release_slot("parallel:a").await.unwrap(), 1);
        assert!(storage.slots.contains_key("parallel:a"));

        assert_eq!(storage.release_slot("parallel:a").await.unwrap(), 0);
        assert!(!storage.slots.contains_key("parallel:a"));
    }

    #[tokio::test(start_paused = true)]
    async fn saturation_expires_without_refresh() {
        let storage = InMemoryStorage::new();

        storage.set_saturation("saturation:global", 0.9).await.unwrap();
        assert_eq!(storage.saturation("saturation:global").await.unwrap(), Some(0.9));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(storage.saturation("saturation:global").await.unwrap(), Some(0.9));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(storage.saturation("saturation:global").await.unwrap(), None);
        assert!(storage.saturation.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_entries() {
        let storage = InMemoryStorage::new();

        for principal in ["a", "b", "c"] {
            storage.record_event(&format!("rpm:{principal}"), 10, MINUTE).await.unwrap();
            storage.reserve(&format!("tpm:{principal}:gpt"), 10, 1000, MINUTE).await.unwrap();
            storage.acquire_slot(&format!("parallel:{principal}"), 1, MINUTE).await.unwrap();
        }

        storage.set_saturation("saturation:global", 0.5).await.unwrap();

        storage.sweep();
        assert_eq!(storage.windows.len(), 3);
        assert_eq!(storage.counters.len(), 3);
        assert_eq!(storage.slots.len(), 3);
        assert_eq!(storage.saturation.len(), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        storage.sweep();

        assert!(storage.windows.is_empty());
        assert!(storage.counters.is_empty());
        assert!(storage.slots.is_empty());
        assert!(storage.saturation.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_runs_while_serving_new_keys() {
        let storage = InMemoryStorage::new();

        for principal in 0..SWEEP_EVERY - 1 {
            storage.record_event(&format!("rpm:{principal}"), 10, MINUTE).await.unwrap();
        }

        tokio::time::advance(MINUTE).await;

        // the next operation triggers a sweep of the now idle windows
        storage.record_event("rpm:fresh", 10, MINUTE).await.unwrap();

        assert_eq!(storage.windows.len(), 1);
        assert!(storage.windows.contains_key("rpm:fresh"));
    }

    #[tokio::test]
    async fn request_quota_blocks_after_burst() {
        let storage = InMemoryStorage::new();

        for _ in 0..5 {
            assert!(storage.check_and_consume("ip:127.0.0.1", 5, MINUTE).await.unwrap().allowed);
        }

        let result = storage.check_and_consume("ip:127.0.0.1", 5, MINUTE).await.unwrap();

        assert!(!result.allowed);
        assert!(result.retry_after.is_some());
    }
}
