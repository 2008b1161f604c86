//! 弹性模块：多窗口限流器，保护外部数据源的调用预算。
//!
//! # Resilience Module
//!
//! Upstream sources publish call budgets per time window (for example 200
//! calls per 15 minutes and 1000 per day). The [`rate_limiter`] tracks every
//! window at once and additionally honors explicit backoff requests such as
//! `Retry-After`.
//!
//! ```rust
//! use smart_cache::clock::system_clock;
//! use smart_cache::config::RateLimitConfig;
//! use smart_cache::resilience::rate_limiter::RateLimiter;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = RateLimitConfig::new()
//!     .with_window("15m", 200, Duration::from_secs(15 * 60))
//!     .with_window("daily", 1000, Duration::from_secs(24 * 60 * 60));
//! let limiter = RateLimiter::new(&config, system_clock());
//!
//! if limiter.try_acquire().await.is_allowed() {
//!     // Make the upstream call...
//! }
//! # }
//! ```

pub mod rate_limiter;
