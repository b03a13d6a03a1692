//! Error types for rate limiting.

use crate::storage::StorageError;
use std::time::Duration;

/// Errors that can occur during rate limiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Global rate limit exceeded.
    #[error("Global rate limit exceeded")]
    GlobalLimitExceeded {
        /// Time to wait before retrying.
        retry_after: Duration,
    },

    /// IP-specific rate limit exceeded.
    #[error("IP rate limit exceeded")]
    IpLimitExceeded {
        /// Time to wait before retrying.
        retry_after: Duration,
    },

    /// Requests-per-minute limit of the principal exceeded.
    #[error("Rate limit exceeded: {limit} requests per minute")]
    RequestsExceeded {
        /// Effective limit after throttling.
        limit: u64,
    },

    /// Tokens-per-minute limit of the principal exceeded.
    #[error("Rate limit exceeded: {limit} tokens per minute for model {model}")]
    TokensExceeded {
        /// Model the reservation was made for.
        model: String,
        /// Effective limit after throttling.
        limit: u64,
    },

    /// Maximum number of in-flight requests reached.
    #[error("Maximum parallel requests reached: {limit}")]
    ParallelExceeded {
        /// Configured parallel limit.
        limit: u64,
    },

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl RateLimitError {
    /// Get the retry-after duration if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::GlobalLimitExceeded { retry_after } => Some(*retry_after),
            Self::IpLimitExceeded { retry_after } => Some(*retry_after),
            Self::RequestsExceeded { .. } | Self::TokensExceeded { .. } => Some(Duration::from_secs(60)),
            Self::ParallelExceeded { .. } | Self::Storage(_) => None,
        }
    }
}
