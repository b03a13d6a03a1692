//! Server-level request limits: a global quota and a quota per client IP.

use std::net::IpAddr;
use std::sync::Arc;

use config::RateLimitConfig;

use crate::error::RateLimitError;
use crate::storage::Storage;

/// Applies the global and per-IP quotas of the server configuration.
pub struct RateLimitManager {
    config: RateLimitConfig,
    storage: Arc<Storage>,
}

impl RateLimitManager {
    /// Create a manager on top of the shared storage.
    pub fn new(config: RateLimitConfig, storage: Arc<Storage>) -> Self {
        Self { config, storage }
    }

    /// Whether any request quota is configured and enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && (self.config.global.is_some() || self.config.per_ip.is_some())
    }

    /// Check the global quota, then the quota of the client address.
    ///
    /// Storage errors admit the request.
    pub async fn check_request(&self, ip: Option<IpAddr>) -> Result<(), RateLimitError> {
        if !self.is_enabled() {
            return Ok(());
        }

        self.check_global_limit().await?;
        self.check_ip_limit(ip).await?;

        Ok(())
    }

    async fn check_global_limit(&self) -> Result<(), RateLimitError> {
        let Some(quota) = &self.config.global else {
            return Ok(());
        };

        match self.storage.check_and_consume("global", quota.limit, quota.duration).await {
            Ok(result) if !result.allowed => Err(RateLimitError::GlobalLimitExceeded {
                retry_after: result.retry_after.unwrap_or_default(),
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Global rate limit check failed, admitting: {e}");
                Ok(())
            }
        }
    }

    async fn check_ip_limit(&self, ip: Option<IpAddr>) -> Result<(), RateLimitError> {
        let (Some(ip), Some(quota)) = (ip, &self.config.per_ip) else {
            return Ok(());
        };

        let key = format!("ip:{ip}");

        match self.storage.check_and_consume(&key, quota.limit, quota.duration).await {
            Ok(result) if !result.allowed => Err(RateLimitError::IpLimitExceeded {
                retry_after: result.retry_after.unwrap_or_default(),
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Rate limit check for {ip} failed, admitting: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use config::{RateLimitConfig, RateLimitQuota, StorageConfig};

    use super::*;

    async fn manager(config: RateLimitConfig) -> RateLimitManager {
        let storage = Storage::new(&StorageConfig::Memory).await.unwrap();
        RateLimitManager::new(config, Arc::new(storage))
    }

    #[tokio::test]
    async fn disabled_admits_everything() {
        let manager = manager(RateLimitConfig {
            enabled: false,
            global: Some(RateLimitQuota {
                limit: 1,
                duration: Duration::from_secs(60),
            }),
            ..Default::default()
        })
        .await;

        for _ in 0..10 {
            manager.check_request(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn per_ip_limits_are_independent() {
        let manager = manager(RateLimitConfig {
            enabled: true,
            per_ip: Some(RateLimitQuota {
                limit: 5,
                duration: Duration::from_secs(60),
            }),
            ..Default::default()
        })
        .await;

        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        for _ in 0..5 {
            manager.check_request(Some(first)).await.unwrap();
        }

        let error = manager.check_request(Some(first)).await.unwrap_err();
        insta::assert_snapshot!(error, @"IP rate limit exceeded");

        manager.check_request(Some(second)).await.unwrap();

        // requests without a known address only count against the global quota
        manager.check_request(None).await.unwrap();
    }
}
