//! Data-fetch layer: providers, rate limiting, caching, and plan execution.
//!
//! The [`fetcher::DataFetcher`] sits on top of a [`provider::MarketDataProvider`]
//! and adds everything the provider should not know about: per-source token
//! buckets, batching with bounded concurrency, a read-through single-flight
//! cache, and retry with exponential backoff.

mod cache;
mod fetcher;
mod http;
mod provider;
mod rate_limit;
mod synthetic;

pub use cache::{cache_key, CacheKey, CacheStats, FetchCache};
pub use fetcher::{BatchFailure, DataFetcher, FetchOutcome, FetcherConfig};
pub use http::HttpProvider;
pub use provider::{BatchRequest, FetchError, MarketDataProvider, ProviderError};
pub use rate_limit::TokenBucket;
pub use synthetic::SyntheticProvider;
