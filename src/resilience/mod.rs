//! # Stage: Resilience
//!
//! ## Responsibility
//! Shared protective state consulted around every backend call: one circuit
//! breaker per backend and a content-addressed response cache with
//! single-flight computation.
//!
//! ## Guarantees
//! - Per-backend / per-key locking only; no lock is held across a backend call
//! - Cancellation-safe: breaker permits and cache leader markers release on drop
//!
//! ## NOT Responsible For
//! - Choosing backends (that belongs to `routing`)
//! - Budget enforcement (that belongs to `budget`)

pub mod cache;
pub mod circuit_breaker;

pub use cache::{CacheKey, CacheOrigin, CacheStats, CachedResponse, ResponseCache};
pub use circuit_breaker::{
    BreakerPermit, BreakerSet, BreakerTransition, CircuitBreaker, CircuitBreakerError,
    CircuitBreakerStats, CircuitStatus, HealthSnapshot,
};
