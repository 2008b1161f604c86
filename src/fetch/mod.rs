//! 抓取模块：带限流闸门与重试策略的上游调用封装。
//!
//! # Fetch Module
//!
//! Everything between the engine and an external source.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Fetcher`] | Capability implemented by the scraping / API layer |
//! | [`CredentialRefresher`] | Hook called once when credentials are rejected |
//! | [`FetchError`] | Typed failure of a single upstream call |
//! | [`RetryingClient`] | Rate-gated retry loop honoring `Retry-After` |
//! | [`http`] | `reqwest` status/header classification for fetcher authors |
//!
//! Every upstream call, listing or enrichment, goes through the same
//! [`RetryingClient`] so the rate budget is shared.

pub mod client;
pub mod http;
mod policy;
pub mod source;

pub use client::RetryingClient;
pub use source::{CredentialRefresher, FetchError, Fetcher, PageParams};
