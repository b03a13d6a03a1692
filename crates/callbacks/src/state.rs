use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::UpstreamRateLimits;

/// Latest upstream rate-limit state per upstream credential fingerprint.
#[derive(Default)]
pub struct RateLimitStateCache {
    entries: DashMap<String, (UpstreamRateLimits, Instant)>,
}

impl RateLimitStateCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the state observed for an upstream credential.
    pub fn update(&self, fingerprint: &str, limits: UpstreamRateLimits) {
        self.entries.insert(fingerprint.to_string(), (limits, Instant::now()));
    }

    /// The last state observed for an upstream credential.
    pub fn get(&self, fingerprint: &str) -> Option<UpstreamRateLimits> {
        self.entries.get(fingerprint).map(|entry| entry.0.clone())
    }

    /// Drop entries older than `ttl`, returning how many were removed.
    pub fn prune(&self, ttl: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();

        self.entries
            .retain(|_, (_, observed)| now.saturating_duration_since(*observed) < ttl);

        before.saturating_sub(self.entries.len())
    }

    /// Prune every `interval` until `shutdown` is cancelled.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration, ttl: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let removed = cache.prune(ttl);

                        if removed > 0 {
                            log::debug!("Pruned {removed} stale upstream rate-limit entries");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use http::HeaderMap;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn limits() -> UpstreamRateLimits {
        UpstreamRateLimits::openai(&HeaderMap::new())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_pruned() {
        let cache = Arc::new(RateLimitStateCache::new());
        let shutdown = CancellationToken::new();
        let pruner = cache.spawn_pruner(Duration::from_secs(60), Duration::from_secs(600), shutdown.clone());

        cache.update("old", limits());
        tokio::time::sleep(Duration::from_secs(400)).await;
        cache.update("new", limits());

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());

        shutdown.cancel();
        pruner.await.unwrap();
    }
}
