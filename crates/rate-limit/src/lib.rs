//! Rate limiting and budget enforcement for Tianji.
//!
//! This crate provides:
//! - Global and per-IP request limits
//! - Per-principal sliding-window RPM, per-model TPM reservations and parallel-request slots
//! - A saturation-driven throttle factor applied to principal limits
//! - Budget evaluation and an in-memory per-model fleet budget limiter
//!
//! Counters live either in memory or in Redis, where every check is a single atomic script.

#![deny(missing_docs)]

mod budget;
mod error;
mod manager;
mod principal;
mod storage;
mod throttle;

pub use budget::{BudgetExceeded, BudgetScope, BudgetSnapshot, ModelBudgetLimiter, check_budget};
pub use error::RateLimitError;
pub use manager::RateLimitManager;
pub use principal::{
    Admission, AdmissionRequest, ParallelSlot, PrincipalLimits, PrincipalRateLimiter, RateLimitHeaders,
    TokenReservation,
};
pub use storage::{Storage, StorageError};
pub use throttle::{effective_limit, throttle_factor};
