//! Telegram Client Facade (C3, §4.3).
//!
//! The only module permitted to hold a `teloxide::Bot` handle. Wraps every
//! outbound call with rate limiting, retry/backoff, a circuit breaker, and
//! `tracing`/`metrics` instrumentation so callers never see Telegram's raw
//! transport errors, only [`crate::error::CoreError`].

mod circuit_breaker;
mod facade;
mod rate_limit;

pub use circuit_breaker::CircuitBreaker;
pub use facade::TelegramFacade;
pub use rate_limit::{ChatRateLimiter, SlidingWindowRateLimiter};
