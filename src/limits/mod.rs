//! Admission control for the shared AI backend: a token-bucket rate
//! limiter and a circuit breaker. These two structs hold the only state
//! in the crate that is mutated concurrently from multiple tasks.

pub mod breaker;
pub mod rate;

pub use breaker::{CallPermit, CircuitBreaker, CircuitPhase};
pub use rate::{RateLimiter, RateLimiterMetrics};
