//! Helpers for fetchers built on `reqwest`.
//!
//! The engine never talks HTTP itself; these functions turn a response's
//! status and headers into the [`FetchError`] vocabulary the retry loop
//! understands.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

use super::source::FetchError;
use crate::clock::elapsed_between;

/// Header carrying `short,long` window usage (Strava style).
pub const RATE_LIMIT_USAGE_HEADER: &str = "x-ratelimit-usage";

/// `None` for success, otherwise the matching [`FetchError`].
pub fn classify_http_response(status: StatusCode, headers: &HeaderMap, body: &str) -> Option<FetchError> {
    classify_http_response_at(status, headers, body, Utc::now())
}

pub fn classify_http_response_at(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let message = truncate(body, 200);
    Some(match status.as_u16() {
        401 => FetchError::Unauthorized(message),
        429 => FetchError::Throttled {
            retry_after: retry_after(headers, now),
        },
        503 if headers.contains_key(RETRY_AFTER) => FetchError::Throttled {
            retry_after: retry_after(headers, now),
        },
        s if (500..=599).contains(&s) => FetchError::Transport(format!("HTTP {}: {}", s, message)),
        s => FetchError::Status { status: s, message },
    })
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|at| elapsed_between(now, at.with_timezone(&Utc)))
}

/// Parse `X-RateLimit-Usage: 120,540` into per-window counts for
/// [`RateLimiter::sync_usage`](crate::resilience::rate_limiter::RateLimiter::sync_usage).
pub fn rate_limit_usage(headers: &HeaderMap) -> Option<Vec<u32>> {
    let value = headers.get(RATE_LIMIT_USAGE_HEADER)?.to_str().ok()?;
    value
        .split(',')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

pub fn from_reqwest_error(err: &reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        if status == StatusCode::UNAUTHORIZED {
            return FetchError::Unauthorized(err.to_string());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return FetchError::Throttled { retry_after: None };
        }
    }
    FetchError::Transport(err.to_string())
}

fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}
