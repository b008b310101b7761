//! Per-provider call gates: rate limits, circuit breakers and retry policy.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    Admission, BreakerPolicy, CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, CircuitStatus, Outcome,
};
pub use rate_limit::{ProviderLimiter, RateLimitPolicy, RateLimitSnapshot, RateLimiterRegistry, Ticket};
pub use retry::{BackoffPolicy, RetryExecutor};
